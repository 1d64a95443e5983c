//! QUIC variable-length integers (RFC 9000 §16).
//!
//! The two high bits of the first byte select a 1, 2, 4 or 8 byte form.
//! Encoders always pick the shortest form. Decoders accept any form whose
//! bytes are present, so a value sent in a wider-than-needed encoding is
//! read back normally.

use alloc::vec::Vec;

use crate::error::{Error, TransportError};

/// Maximum value representable as a QUIC varint (2^62 - 1).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// How many bytes are needed to encode `value`?
pub const fn varint_len(value: u64) -> usize {
    if value <= 63 {
        1
    } else if value <= 16383 {
        2
    } else if value <= 1_073_741_823 {
        4
    } else {
        8
    }
}

/// Decode a QUIC variable-length integer from the front of `buf`.
///
/// Returns `(value, bytes_consumed)` on success.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), Error> {
    let first = *buf.first().ok_or(Error::BufferTooSmall { needed: 1 })?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return Err(Error::BufferTooSmall { needed: len });
    }

    let mut value = u64::from(first & 0x3f);
    for byte in &buf[1..len] {
        value = (value << 8) | u64::from(*byte);
    }
    Ok((value, len))
}

/// Encode `value` into the front of `buf` using the minimal width.
///
/// Returns the number of bytes written.
pub fn encode_varint(value: u64, buf: &mut [u8]) -> Result<usize, Error> {
    if value > MAX_VARINT {
        return Err(Error::Transport(TransportError::InternalError));
    }
    let len = varint_len(value);
    if buf.len() < len {
        return Err(Error::BufferTooSmall { needed: len });
    }

    let bytes = value.to_be_bytes();
    buf[..len].copy_from_slice(&bytes[8 - len..]);
    buf[0] |= match len {
        1 => 0x00,
        2 => 0x40,
        4 => 0x80,
        _ => 0xc0,
    };
    Ok(len)
}

/// Append `value` to a growable buffer using the minimal width.
pub fn push_varint(value: u64, out: &mut Vec<u8>) -> Result<(), Error> {
    let mut tmp = [0u8; 8];
    let len = encode_varint(value, &mut tmp)?;
    out.extend_from_slice(&tmp[..len]);
    Ok(())
}
