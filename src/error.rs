use alloc::string::String;

/// QUIC transport error codes (RFC 9000 §20).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u64)]
pub enum TransportError {
    #[error("no error")]
    NoError = 0x00,
    #[error("internal error")]
    InternalError = 0x01,
    #[error("connection refused")]
    ConnectionRefused = 0x02,
    #[error("flow control error")]
    FlowControlError = 0x03,
    #[error("stream limit error")]
    StreamLimitError = 0x04,
    #[error("stream state error")]
    StreamStateError = 0x05,
    #[error("final size error")]
    FinalSizeError = 0x06,
    #[error("frame encoding error")]
    FrameEncodingError = 0x07,
    #[error("transport parameter error")]
    TransportParameterError = 0x08,
    #[error("connection id limit error")]
    ConnectionIdLimitError = 0x09,
    #[error("protocol violation")]
    ProtocolViolation = 0x0a,
    #[error("invalid token")]
    InvalidToken = 0x0b,
    #[error("application error")]
    ApplicationError = 0x0c,
    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded = 0x0d,
    #[error("key update error")]
    KeyUpdateError = 0x0e,
    #[error("AEAD limit reached")]
    AeadLimitReached = 0x0f,
    #[error("no viable path")]
    NoViablePath = 0x10,
    #[error("version negotiation error")]
    VersionNegotiationError = 0x11,
}

impl TransportError {
    /// Convert a transport error to its RFC 9000 wire code.
    pub const fn to_code(self) -> u64 {
        self as u64
    }

    /// Create a `CryptoError` transport error (0x0100 + TLS alert code).
    pub const fn crypto_error(alert_code: u8) -> u64 {
        0x0100 + alert_code as u64
    }

    /// Parse a wire error code into a `TransportError`.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x00 => Some(Self::NoError),
            0x01 => Some(Self::InternalError),
            0x02 => Some(Self::ConnectionRefused),
            0x03 => Some(Self::FlowControlError),
            0x04 => Some(Self::StreamLimitError),
            0x05 => Some(Self::StreamStateError),
            0x06 => Some(Self::FinalSizeError),
            0x07 => Some(Self::FrameEncodingError),
            0x08 => Some(Self::TransportParameterError),
            0x09 => Some(Self::ConnectionIdLimitError),
            0x0a => Some(Self::ProtocolViolation),
            0x0b => Some(Self::InvalidToken),
            0x0c => Some(Self::ApplicationError),
            0x0d => Some(Self::CryptoBufferExceeded),
            0x0e => Some(Self::KeyUpdateError),
            0x0f => Some(Self::AeadLimitReached),
            0x10 => Some(Self::NoViablePath),
            0x11 => Some(Self::VersionNegotiationError),
            _ => None,
        }
    }
}

/// Top-level crate error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// QUIC transport error. Fatal to the connection when raised by the peer's
    /// traffic; returned synchronously when raised by a local API call.
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// Datagram too short for a header, or an invalid first byte.
    #[error("malformed packet")]
    MalformedPacket,
    /// Missing keys, tampered ciphertext or header protection mismatch.
    #[error("decryption failure")]
    DecryptionFailure,
    /// Packet number already accepted, or older than the replay window.
    #[error("replayed packet")]
    ReplayedPacket,
    #[error("unknown congestion control algorithm: {0}")]
    UnknownCongestionControlAlgorithm(String),
    /// The stream's send side has already been finished or reset.
    #[error("stream already finished")]
    StreamFinished,
    #[error("unknown stream")]
    UnknownStream,
    /// No more stream slots available under the peer's MAX_STREAMS limit.
    #[error("stream limit exhausted")]
    StreamLimitExhausted,
    /// Invalid state for the requested operation.
    #[error("invalid state")]
    InvalidState,
    /// Caller-provided buffer too small.
    #[error("buffer too small, need {needed} bytes")]
    BufferTooSmall { needed: usize },
    /// Cryptographic primitive failed (bad key length, backend error).
    #[error("cryptographic error")]
    Crypto,
    /// The handshake engine rejected its input.
    #[error("handshake error: {0}")]
    Handshake(String),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}
