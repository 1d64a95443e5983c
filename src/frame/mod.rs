//! QUIC frame codec (RFC 9000 sections 12.4, 19).
//!
//! Pure encode/decode: no I/O, no connection state. Decoded frames borrow
//! their data fields from the packet payload (zero-copy). Decoding never
//! reads past the end of the buffer it is handed; a length field that would
//! overrun it yields `FRAME_ENCODING_ERROR`.
use alloc::vec::Vec;
use core::ops::Range;

use crate::error::{Error, TransportError};
use crate::transport::range_set::RangeSet;
use crate::varint::{decode_varint, push_varint, varint_len, MAX_VARINT};

// ---------------------------------------------------------------------------
// Sub-structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame<'a> {
    pub largest_ack: u64,
    /// Raw ACK delay field, before scaling by the ack_delay_exponent.
    pub ack_delay: u64,
    pub first_ack_range: u64,
    /// Raw remaining ACK range bytes (pairs of gap + range varints),
    /// validated at decode time.
    pub ack_ranges: &'a [u8],
    pub ecn: Option<EcnCounts>,
}

impl AckFrame<'_> {
    /// Acknowledged packet numbers as half-open ranges, largest first.
    pub fn ranges(&self) -> AckRanges<'_> {
        AckRanges {
            pending_first: Some(self.first_ack_range),
            largest: self.largest_ack,
            smallest: 0,
            buf: self.ack_ranges,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ecn_ce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: u64,
    pub error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: u64,
    pub error_code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: u64,
    pub offset: u64,
    pub data: &'a [u8],
    pub fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: u64,
    pub max_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub bidirectional: bool,
    pub max_streams: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: u64,
    pub data_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub bidirectional: bool,
    pub max_streams: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame<'a> {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: &'a [u8],
    pub stateless_reset_token: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame<'a> {
    /// `true` for application close (0x1d), `false` for transport close (0x1c).
    pub is_application: bool,
    pub error_code: u64,
    /// Only meaningful for transport close (0x1c).
    pub frame_type: u64,
    pub reason: &'a [u8],
}

// ---------------------------------------------------------------------------
// Frame enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding,                                   // 0x00
    Ping,                                      // 0x01
    Ack(AckFrame<'a>),                         // 0x02-0x03
    ResetStream(ResetStreamFrame),             // 0x04
    StopSending(StopSendingFrame),             // 0x05
    Crypto(CryptoFrame<'a>),                   // 0x06
    NewToken(&'a [u8]),                        // 0x07
    Stream(StreamFrame<'a>),                   // 0x08-0x0f
    MaxData(u64),                              // 0x10
    MaxStreamData(MaxStreamDataFrame),         // 0x11
    MaxStreams(MaxStreamsFrame),               // 0x12-0x13
    DataBlocked(u64),                          // 0x14
    StreamDataBlocked(StreamDataBlockedFrame), // 0x15
    StreamsBlocked(StreamsBlockedFrame),       // 0x16-0x17
    NewConnectionId(NewConnectionIdFrame<'a>), // 0x18
    RetireConnectionId(u64),                   // 0x19
    PathChallenge([u8; 8]),                    // 0x1a
    PathResponse([u8; 8]),                     // 0x1b
    ConnectionClose(ConnectionCloseFrame<'a>), // 0x1c-0x1d
    HandshakeDone,                             // 0x1e
}

impl Frame<'_> {
    /// Wire type of this frame, as reported in a CONNECTION_CLOSE.
    pub fn frame_type(&self) -> u64 {
        match self {
            Frame::Padding => 0x00,
            Frame::Ping => 0x01,
            Frame::Ack(a) => {
                if a.ecn.is_some() {
                    0x03
                } else {
                    0x02
                }
            }
            Frame::ResetStream(_) => 0x04,
            Frame::StopSending(_) => 0x05,
            Frame::Crypto(_) => 0x06,
            Frame::NewToken(_) => 0x07,
            Frame::Stream(s) => 0x08 | 0x02 | u64::from(s.offset > 0) << 2 | u64::from(s.fin),
            Frame::MaxData(_) => 0x10,
            Frame::MaxStreamData(_) => 0x11,
            Frame::MaxStreams(m) => {
                if m.bidirectional {
                    0x12
                } else {
                    0x13
                }
            }
            Frame::DataBlocked(_) => 0x14,
            Frame::StreamDataBlocked(_) => 0x15,
            Frame::StreamsBlocked(s) => {
                if s.bidirectional {
                    0x16
                } else {
                    0x17
                }
            }
            Frame::NewConnectionId(_) => 0x18,
            Frame::RetireConnectionId(_) => 0x19,
            Frame::PathChallenge(_) => 0x1a,
            Frame::PathResponse(_) => 0x1b,
            Frame::ConnectionClose(c) => {
                if c.is_application {
                    0x1d
                } else {
                    0x1c
                }
            }
            Frame::HandshakeDone => 0x1e,
        }
    }

    /// Whether receiving this frame obliges the peer to send an ACK.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    /// Probing frames (RFC 9000 §9.1) do not trigger migration.
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Frame::Padding
                | Frame::PathChallenge(_)
                | Frame::PathResponse(_)
                | Frame::NewConnectionId(_)
        )
    }

    /// Frames permitted in Initial and Handshake packets (RFC 9000 §12.4).
    pub fn allowed_in_handshake_space(&self) -> bool {
        match self {
            Frame::Padding | Frame::Ping | Frame::Ack(_) | Frame::Crypto(_) => true,
            Frame::ConnectionClose(c) => !c.is_application,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ACK ranges
// ---------------------------------------------------------------------------

/// Iterator over the packet-number ranges of an [`AckFrame`], largest first.
///
/// Range arithmetic was checked when the frame was decoded, so iteration
/// simply stops if the bytes are inconsistent.
pub struct AckRanges<'a> {
    pending_first: Option<u64>,
    largest: u64,
    smallest: u64,
    buf: &'a [u8],
}

impl Iterator for AckRanges<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        if let Some(first) = self.pending_first.take() {
            self.smallest = self.largest.checked_sub(first)?;
            return Some(self.smallest..self.largest + 1);
        }
        if self.buf.is_empty() {
            return None;
        }
        let (gap, n1) = decode_varint(self.buf).ok()?;
        let (len, n2) = decode_varint(self.buf.get(n1..)?).ok()?;
        self.buf = &self.buf[n1 + n2..];
        self.largest = self.smallest.checked_sub(gap)?.checked_sub(2)?;
        self.smallest = self.largest.checked_sub(len)?;
        Some(self.smallest..self.largest + 1)
    }
}

/// Append an ACK frame covering `received` to `out`.
///
/// `ack_delay` is the already-scaled wire value. At most `max_ranges`
/// ranges are written, newest first.
pub fn encode_ack(
    received: &RangeSet,
    ack_delay: u64,
    max_ranges: usize,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let mut ranges = received.iter().rev().take(max_ranges.max(1));
    let first = ranges.next().ok_or(Error::InvalidState)?;
    let largest = first.end - 1;

    push_varint(0x02, out)?;
    push_varint(largest, out)?;
    push_varint(ack_delay, out)?;
    let count = received.len().min(max_ranges.max(1)) - 1;
    push_varint(count as u64, out)?;
    push_varint(largest - first.start, out)?;

    let mut smallest = first.start;
    for range in ranges {
        let gap = smallest - range.end - 1;
        push_varint(gap, out)?;
        push_varint(range.end - 1 - range.start, out)?;
        smallest = range.start;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Frame-encoding error for malformed wire data.
fn frame_encoding_error() -> Error {
    Error::Transport(TransportError::FrameEncodingError)
}

/// Decode a varint from `buf[pos..]`, advancing `pos`.
fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let rest = buf.get(*pos..).ok_or_else(frame_encoding_error)?;
    let (val, n) = decode_varint(rest).map_err(|_| frame_encoding_error())?;
    *pos += n;
    Ok(val)
}

/// Read exactly `len` bytes from `buf[pos..]`, advancing `pos`.
fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: u64) -> Result<&'a [u8], Error> {
    let remaining = (buf.len() - *pos) as u64;
    if remaining < len {
        return Err(frame_encoding_error());
    }
    let len = len as usize;
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

fn read_array<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N], Error> {
    let bytes = read_bytes(buf, pos, N as u64)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one frame starting at `cursor` within a packet payload.
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8], cursor: usize) -> Result<(Frame<'_>, usize), Error> {
    let rest = buf.get(cursor..).ok_or_else(frame_encoding_error)?;
    decode(rest)
}

/// Decode one QUIC frame from the front of `buf`.
///
/// Returns the decoded frame and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Frame<'_>, usize), Error> {
    let mut pos = 0;
    let frame_type = read_varint(buf, &mut pos)?;

    let frame = match frame_type {
        0x00 => {
            // Runs of padding collapse into a single frame.
            while buf.get(pos) == Some(&0) {
                pos += 1;
            }
            Frame::Padding
        }

        0x01 => Frame::Ping,

        0x02 | 0x03 => {
            let largest_ack = read_varint(buf, &mut pos)?;
            let ack_delay = read_varint(buf, &mut pos)?;
            let ack_range_count = read_varint(buf, &mut pos)?;
            let first_ack_range = read_varint(buf, &mut pos)?;
            let mut smallest = largest_ack
                .checked_sub(first_ack_range)
                .ok_or_else(frame_encoding_error)?;

            let ranges_start = pos;
            for _ in 0..ack_range_count {
                let gap = read_varint(buf, &mut pos)?;
                let len = read_varint(buf, &mut pos)?;
                let largest = smallest
                    .checked_sub(gap)
                    .and_then(|v| v.checked_sub(2))
                    .ok_or_else(frame_encoding_error)?;
                smallest = largest.checked_sub(len).ok_or_else(frame_encoding_error)?;
            }
            let ack_ranges = &buf[ranges_start..pos];

            let ecn = if frame_type == 0x03 {
                Some(EcnCounts {
                    ect0: read_varint(buf, &mut pos)?,
                    ect1: read_varint(buf, &mut pos)?,
                    ecn_ce: read_varint(buf, &mut pos)?,
                })
            } else {
                None
            };

            Frame::Ack(AckFrame {
                largest_ack,
                ack_delay,
                first_ack_range,
                ack_ranges,
                ecn,
            })
        }

        0x04 => Frame::ResetStream(ResetStreamFrame {
            stream_id: read_varint(buf, &mut pos)?,
            error_code: read_varint(buf, &mut pos)?,
            final_size: read_varint(buf, &mut pos)?,
        }),

        0x05 => Frame::StopSending(StopSendingFrame {
            stream_id: read_varint(buf, &mut pos)?,
            error_code: read_varint(buf, &mut pos)?,
        }),

        0x06 => {
            let offset = read_varint(buf, &mut pos)?;
            let length = read_varint(buf, &mut pos)?;
            if offset + length > MAX_VARINT {
                return Err(frame_encoding_error());
            }
            let data = read_bytes(buf, &mut pos, length)?;
            Frame::Crypto(CryptoFrame { offset, data })
        }

        0x07 => {
            let length = read_varint(buf, &mut pos)?;
            let token = read_bytes(buf, &mut pos, length)?;
            if token.is_empty() {
                return Err(frame_encoding_error());
            }
            Frame::NewToken(token)
        }

        0x08..=0x0f => {
            let has_offset = frame_type & 0x04 != 0;
            let has_length = frame_type & 0x02 != 0;
            let fin = frame_type & 0x01 != 0;

            let stream_id = read_varint(buf, &mut pos)?;
            let offset = if has_offset {
                read_varint(buf, &mut pos)?
            } else {
                0
            };
            let data = if has_length {
                let length = read_varint(buf, &mut pos)?;
                read_bytes(buf, &mut pos, length)?
            } else {
                // Data extends to end of packet.
                let rest = &buf[pos..];
                pos = buf.len();
                rest
            };
            if offset + data.len() as u64 > MAX_VARINT {
                return Err(frame_encoding_error());
            }

            Frame::Stream(StreamFrame {
                stream_id,
                offset,
                data,
                fin,
            })
        }

        0x10 => Frame::MaxData(read_varint(buf, &mut pos)?),

        0x11 => Frame::MaxStreamData(MaxStreamDataFrame {
            stream_id: read_varint(buf, &mut pos)?,
            max_data: read_varint(buf, &mut pos)?,
        }),

        0x12 | 0x13 => {
            let max_streams = read_varint(buf, &mut pos)?;
            if max_streams > 1 << 60 {
                return Err(frame_encoding_error());
            }
            Frame::MaxStreams(MaxStreamsFrame {
                bidirectional: frame_type == 0x12,
                max_streams,
            })
        }

        0x14 => Frame::DataBlocked(read_varint(buf, &mut pos)?),

        0x15 => Frame::StreamDataBlocked(StreamDataBlockedFrame {
            stream_id: read_varint(buf, &mut pos)?,
            data_limit: read_varint(buf, &mut pos)?,
        }),

        0x16 | 0x17 => Frame::StreamsBlocked(StreamsBlockedFrame {
            bidirectional: frame_type == 0x16,
            max_streams: read_varint(buf, &mut pos)?,
        }),

        0x18 => {
            let sequence_number = read_varint(buf, &mut pos)?;
            let retire_prior_to = read_varint(buf, &mut pos)?;
            let cid_len = read_varint(buf, &mut pos)?;
            if cid_len == 0 || cid_len > 20 || retire_prior_to > sequence_number {
                return Err(frame_encoding_error());
            }
            let connection_id = read_bytes(buf, &mut pos, cid_len)?;
            let stateless_reset_token = read_array::<16>(buf, &mut pos)?;
            Frame::NewConnectionId(NewConnectionIdFrame {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            })
        }

        0x19 => Frame::RetireConnectionId(read_varint(buf, &mut pos)?),

        0x1a => Frame::PathChallenge(read_array::<8>(buf, &mut pos)?),

        0x1b => Frame::PathResponse(read_array::<8>(buf, &mut pos)?),

        0x1c | 0x1d => {
            let is_application = frame_type == 0x1d;
            let error_code = read_varint(buf, &mut pos)?;
            let frame_type_field = if is_application {
                0
            } else {
                read_varint(buf, &mut pos)?
            };
            let reason_len = read_varint(buf, &mut pos)?;
            let reason = read_bytes(buf, &mut pos, reason_len)?;
            Frame::ConnectionClose(ConnectionCloseFrame {
                is_application,
                error_code,
                frame_type: frame_type_field,
                reason,
            })
        }

        0x1e => Frame::HandshakeDone,

        _ => return Err(frame_encoding_error()),
    };

    Ok((frame, pos))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Bytes taken by a STREAM frame header carrying `len` bytes at `offset`.
pub fn stream_frame_overhead(stream_id: u64, offset: u64, len: usize) -> usize {
    let offset_len = if offset > 0 { varint_len(offset) } else { 0 };
    1 + varint_len(stream_id) + offset_len + varint_len(len as u64)
}

/// Bytes taken by a CRYPTO frame header carrying `len` bytes at `offset`.
pub fn crypto_frame_overhead(offset: u64, len: usize) -> usize {
    1 + varint_len(offset) + varint_len(len as u64)
}

/// Encode one frame into a freshly allocated buffer.
pub fn encode_frame(frame: &Frame<'_>) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode(frame, &mut out)?;
    Ok(out)
}

/// Append one QUIC frame to `out`.
///
/// Integers are always written in their minimal varint form. STREAM frames
/// always carry an explicit length.
pub fn encode(frame: &Frame<'_>, out: &mut Vec<u8>) -> Result<(), Error> {
    push_varint(frame.frame_type(), out)?;

    match frame {
        Frame::Padding | Frame::Ping | Frame::HandshakeDone => {}

        Frame::Ack(ack) => {
            push_varint(ack.largest_ack, out)?;
            push_varint(ack.ack_delay, out)?;
            let count = ack.ranges().count().saturating_sub(1);
            push_varint(count as u64, out)?;
            push_varint(ack.first_ack_range, out)?;
            out.extend_from_slice(ack.ack_ranges);
            if let Some(ecn) = &ack.ecn {
                push_varint(ecn.ect0, out)?;
                push_varint(ecn.ect1, out)?;
                push_varint(ecn.ecn_ce, out)?;
            }
        }

        Frame::ResetStream(f) => {
            push_varint(f.stream_id, out)?;
            push_varint(f.error_code, out)?;
            push_varint(f.final_size, out)?;
        }

        Frame::StopSending(f) => {
            push_varint(f.stream_id, out)?;
            push_varint(f.error_code, out)?;
        }

        Frame::Crypto(f) => {
            push_varint(f.offset, out)?;
            push_varint(f.data.len() as u64, out)?;
            out.extend_from_slice(f.data);
        }

        Frame::NewToken(token) => {
            push_varint(token.len() as u64, out)?;
            out.extend_from_slice(token);
        }

        Frame::Stream(f) => {
            push_varint(f.stream_id, out)?;
            if f.offset > 0 {
                push_varint(f.offset, out)?;
            }
            push_varint(f.data.len() as u64, out)?;
            out.extend_from_slice(f.data);
        }

        Frame::MaxData(v) | Frame::DataBlocked(v) | Frame::RetireConnectionId(v) => {
            push_varint(*v, out)?;
        }

        Frame::MaxStreamData(f) => {
            push_varint(f.stream_id, out)?;
            push_varint(f.max_data, out)?;
        }

        Frame::MaxStreams(f) => push_varint(f.max_streams, out)?,

        Frame::StreamDataBlocked(f) => {
            push_varint(f.stream_id, out)?;
            push_varint(f.data_limit, out)?;
        }

        Frame::StreamsBlocked(f) => push_varint(f.max_streams, out)?,

        Frame::NewConnectionId(f) => {
            push_varint(f.sequence_number, out)?;
            push_varint(f.retire_prior_to, out)?;
            push_varint(f.connection_id.len() as u64, out)?;
            out.extend_from_slice(f.connection_id);
            out.extend_from_slice(&f.stateless_reset_token);
        }

        Frame::PathChallenge(data) | Frame::PathResponse(data) => out.extend_from_slice(data),

        Frame::ConnectionClose(f) => {
            push_varint(f.error_code, out)?;
            if !f.is_application {
                push_varint(f.frame_type, out)?;
            }
            push_varint(f.reason.len() as u64, out)?;
            out.extend_from_slice(f.reason);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
