//! QUIC transport parameters (RFC 9000 section 18).
//!
//! Encoded as a sequence of (id: varint, length: varint, value: bytes)
//! where integer values are varint-encoded.

use alloc::vec::Vec;

use crate::connection::cid::ConnectionId;
use crate::error::{Error, TransportError};
use crate::varint::{decode_varint, push_varint, varint_len};

/// QUIC transport parameters exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Server only: DCID of the client's first Initial.
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Maximum idle timeout in milliseconds (0 = disabled).
    pub max_idle_timeout: u64,
    /// Server only.
    pub stateless_reset_token: Option<[u8; 16]>,
    /// Maximum UDP payload size (default 65527).
    pub max_udp_payload_size: u64,
    /// Maximum total data the peer may send (flow control).
    pub initial_max_data: u64,
    /// Initial max data on locally-initiated bidi streams.
    pub initial_max_stream_data_bidi_local: u64,
    /// Initial max data on remotely-initiated bidi streams.
    pub initial_max_stream_data_bidi_remote: u64,
    /// Initial max data on unidirectional streams.
    pub initial_max_stream_data_uni: u64,
    /// Maximum number of bidi streams the peer may open.
    pub initial_max_streams_bidi: u64,
    /// Maximum number of uni streams the peer may open.
    pub initial_max_streams_uni: u64,
    /// ACK delay exponent (default 3).
    pub ack_delay_exponent: u64,
    /// Maximum ACK delay in milliseconds (default 25).
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    /// Active connection ID limit (default 2).
    pub active_connection_id_limit: u64,
    /// SCID of the sender's first Initial.
    pub initial_source_connection_id: Option<ConnectionId>,
}

// Parameter IDs
const PARAM_ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
const PARAM_MAX_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u64 = 0x02;
const PARAM_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x0a;
const PARAM_MAX_ACK_DELAY: u64 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const PARAM_INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;

/// Largest value a peer may send for max_ack_delay, in milliseconds.
const MAX_ACK_DELAY_LIMIT: u64 = 1 << 14;

impl Default for TransportParams {
    /// Protocol defaults: what a peer is assumed to have sent when a
    /// parameter is absent.
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
        }
    }
}

fn param_error() -> Error {
    Error::Transport(TransportError::TransportParameterError)
}

impl TransportParams {
    /// Create transport parameters with sensible defaults.
    pub fn default_params() -> Self {
        Self {
            max_idle_timeout: 30_000,
            initial_max_data: 1_048_576,
            initial_max_stream_data_bidi_local: 262_144,
            initial_max_stream_data_bidi_remote: 262_144,
            initial_max_stream_data_uni: 262_144,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            ..Self::default()
        }
    }

    /// Encode a single integer parameter: id + length + varint value.
    fn encode_param(id: u64, value: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        push_varint(id, out)?;
        push_varint(varint_len(value) as u64, out)?;
        push_varint(value, out)
    }

    fn encode_bytes(id: u64, value: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        push_varint(id, out)?;
        push_varint(value.len() as u64, out)?;
        out.extend_from_slice(value);
        Ok(())
    }

    /// Append the encoded parameters to `out`. Parameters equal to their
    /// protocol default are still written, except absent optional ones.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        if let Some(cid) = &self.original_destination_connection_id {
            Self::encode_bytes(PARAM_ORIGINAL_DESTINATION_CONNECTION_ID, cid, out)?;
        }
        Self::encode_param(PARAM_MAX_IDLE_TIMEOUT, self.max_idle_timeout, out)?;
        if let Some(token) = &self.stateless_reset_token {
            Self::encode_bytes(PARAM_STATELESS_RESET_TOKEN, token, out)?;
        }
        Self::encode_param(PARAM_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size, out)?;
        Self::encode_param(PARAM_INITIAL_MAX_DATA, self.initial_max_data, out)?;
        Self::encode_param(
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
            out,
        )?;
        Self::encode_param(
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
            out,
        )?;
        Self::encode_param(
            PARAM_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
            out,
        )?;
        Self::encode_param(PARAM_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi, out)?;
        Self::encode_param(PARAM_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni, out)?;
        Self::encode_param(PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent, out)?;
        Self::encode_param(PARAM_MAX_ACK_DELAY, self.max_ack_delay, out)?;
        if self.disable_active_migration {
            Self::encode_bytes(PARAM_DISABLE_ACTIVE_MIGRATION, &[], out)?;
        }
        Self::encode_param(
            PARAM_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
            out,
        )?;
        if let Some(cid) = &self.initial_source_connection_id {
            Self::encode_bytes(PARAM_INITIAL_SOURCE_CONNECTION_ID, cid, out)?;
        }
        Ok(())
    }

    /// Decode and validate transport parameters.
    ///
    /// Malformed values, out-of-range limits and repeated parameters are a
    /// TRANSPORT_PARAMETER_ERROR. Unknown parameters are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut params = Self::default();
        // IDs 0x00..=0x0f seen so far
        let mut seen: u32 = 0;

        let mut off = 0;
        while off < buf.len() {
            let (id, id_len) = decode_varint(&buf[off..]).map_err(|_| param_error())?;
            off += id_len;

            let (param_len, len_len) = decode_varint(&buf[off..]).map_err(|_| param_error())?;
            off += len_len;

            let param_len = usize::try_from(param_len).map_err(|_| param_error())?;
            if buf.len() - off < param_len {
                return Err(param_error());
            }
            let param_data = &buf[off..off + param_len];
            off += param_len;

            if id < 32 {
                let bit = 1u32 << id;
                if seen & bit != 0 {
                    return Err(param_error());
                }
                seen |= bit;
            }

            match id {
                PARAM_ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id =
                        Some(ConnectionId::new(param_data).map_err(|_| param_error())?);
                }
                PARAM_INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id =
                        Some(ConnectionId::new(param_data).map_err(|_| param_error())?);
                }
                PARAM_STATELESS_RESET_TOKEN => {
                    let token: [u8; 16] = param_data.try_into().map_err(|_| param_error())?;
                    params.stateless_reset_token = Some(token);
                }
                PARAM_DISABLE_ACTIVE_MIGRATION => {
                    if !param_data.is_empty() {
                        return Err(param_error());
                    }
                    params.disable_active_migration = true;
                }
                PARAM_MAX_IDLE_TIMEOUT
                | PARAM_MAX_UDP_PAYLOAD_SIZE
                | PARAM_INITIAL_MAX_DATA
                | PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL
                | PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE
                | PARAM_INITIAL_MAX_STREAM_DATA_UNI
                | PARAM_INITIAL_MAX_STREAMS_BIDI
                | PARAM_INITIAL_MAX_STREAMS_UNI
                | PARAM_ACK_DELAY_EXPONENT
                | PARAM_MAX_ACK_DELAY
                | PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    let (value, used) = decode_varint(param_data).map_err(|_| param_error())?;
                    if used != param_data.len() {
                        return Err(param_error());
                    }
                    let field = match id {
                        PARAM_MAX_IDLE_TIMEOUT => &mut params.max_idle_timeout,
                        PARAM_MAX_UDP_PAYLOAD_SIZE => &mut params.max_udp_payload_size,
                        PARAM_INITIAL_MAX_DATA => &mut params.initial_max_data,
                        PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                            &mut params.initial_max_stream_data_bidi_local
                        }
                        PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                            &mut params.initial_max_stream_data_bidi_remote
                        }
                        PARAM_INITIAL_MAX_STREAM_DATA_UNI => &mut params.initial_max_stream_data_uni,
                        PARAM_INITIAL_MAX_STREAMS_BIDI => &mut params.initial_max_streams_bidi,
                        PARAM_INITIAL_MAX_STREAMS_UNI => &mut params.initial_max_streams_uni,
                        PARAM_ACK_DELAY_EXPONENT => &mut params.ack_delay_exponent,
                        PARAM_MAX_ACK_DELAY => &mut params.max_ack_delay,
                        _ => &mut params.active_connection_id_limit,
                    };
                    *field = value;
                }
                // Unknown parameters are ignored.
                _ => {}
            }
        }

        params.validate()?;
        Ok(params)
    }

    /// Range checks of RFC 9000 §18.2.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_udp_payload_size < 1200
            || self.ack_delay_exponent > 20
            || self.max_ack_delay >= MAX_ACK_DELAY_LIMIT
            || self.active_connection_id_limit < 2
            || self.initial_max_streams_bidi > 1 << 60
            || self.initial_max_streams_uni > 1 << 60
        {
            return Err(param_error());
        }
        Ok(())
    }
}
