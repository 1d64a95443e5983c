//! Long (RFC 9000 §17.2) and short (§17.3) header parsing and encoding.

use alloc::vec::Vec;

use crate::error::Error;
use crate::packet::{PacketHeader, PacketType, MAX_CID_LEN, QUIC_VERSION_1};
use crate::varint::{decode_varint, push_varint};

/// Retry packets end with a 16-byte integrity tag (RFC 9001 §5.8).
const RETRY_INTEGRITY_TAG_LEN: usize = 16;

fn read_cid<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], Error> {
    let len = *buf.get(*pos).ok_or(Error::MalformedPacket)? as usize;
    *pos += 1;
    if len > MAX_CID_LEN || buf.len() < *pos + len {
        return Err(Error::MalformedPacket);
    }
    let cid = &buf[*pos..*pos + len];
    *pos += len;
    Ok(cid)
}

fn read_length(buf: &[u8], pos: &mut usize) -> Result<usize, Error> {
    let rest = buf.get(*pos..).ok_or(Error::MalformedPacket)?;
    let (value, n) = decode_varint(rest).map_err(|_| Error::MalformedPacket)?;
    *pos += n;
    usize::try_from(value).map_err(|_| Error::MalformedPacket)
}

/// Decode the header of the packet at the front of `buf`.
///
/// `short_dcid_len` is the length of our own connection IDs; short headers
/// do not carry it. The returned `packet_len` delimits this packet so the
/// caller can step to the next coalesced one.
pub fn decode_header(buf: &[u8], short_dcid_len: usize) -> Result<PacketHeader<'_>, Error> {
    let first_byte = *buf.first().ok_or(Error::MalformedPacket)?;

    if first_byte & 0x80 == 0 {
        let pn_offset = 1 + short_dcid_len;
        if first_byte & 0x40 == 0 || buf.len() <= pn_offset {
            return Err(Error::MalformedPacket);
        }
        return Ok(PacketHeader {
            packet_type: PacketType::OneRtt,
            first_byte,
            version: 0,
            dcid: &buf[1..pn_offset],
            scid: &[],
            token: &[],
            supported_versions: &[],
            pn_offset,
            packet_len: buf.len(),
        });
    }

    // first byte + version + two CID length bytes
    if buf.len() < 7 {
        return Err(Error::MalformedPacket);
    }
    let version = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let mut pos = 5;
    let dcid = read_cid(buf, &mut pos)?;
    let scid = read_cid(buf, &mut pos)?;

    if version == 0 {
        return Ok(PacketHeader {
            packet_type: PacketType::VersionNegotiation,
            first_byte,
            version,
            dcid,
            scid,
            token: &[],
            supported_versions: &buf[pos..],
            pn_offset: pos,
            packet_len: buf.len(),
        });
    }
    if version != QUIC_VERSION_1 || first_byte & 0x40 == 0 {
        return Err(Error::MalformedPacket);
    }

    let packet_type = match (first_byte >> 4) & 0x03 {
        0b00 => PacketType::Initial,
        0b01 => PacketType::ZeroRtt,
        0b10 => PacketType::Handshake,
        _ => PacketType::Retry,
    };

    if packet_type == PacketType::Retry {
        if buf.len() < pos + RETRY_INTEGRITY_TAG_LEN {
            return Err(Error::MalformedPacket);
        }
        return Ok(PacketHeader {
            packet_type,
            first_byte,
            version,
            dcid,
            scid,
            token: &buf[pos..buf.len() - RETRY_INTEGRITY_TAG_LEN],
            supported_versions: &[],
            pn_offset: pos,
            packet_len: buf.len(),
        });
    }

    let token: &[u8] = if packet_type == PacketType::Initial {
        let len = read_length(buf, &mut pos)?;
        if buf.len() < pos + len {
            return Err(Error::MalformedPacket);
        }
        pos += len;
        &buf[pos - len..pos]
    } else {
        &[]
    };

    let length = read_length(buf, &mut pos)?;
    let packet_len = pos.checked_add(length).ok_or(Error::MalformedPacket)?;
    if length == 0 || packet_len > buf.len() {
        return Err(Error::MalformedPacket);
    }

    Ok(PacketHeader {
        packet_type,
        first_byte,
        version,
        dcid,
        scid,
        token,
        supported_versions: &[],
        pn_offset: pos,
        packet_len,
    })
}

/// Append a long header (Initial, 0-RTT or Handshake) up to and including
/// the Length field.
///
/// `remainder_len` is the packet number length plus the sealed payload
/// length, at most 16383. The Length field is always written in two bytes.
/// Returns the offset, within `out`, where the packet number goes.
pub fn encode_long_header(
    packet_type: PacketType,
    dcid: &[u8],
    scid: &[u8],
    token: &[u8],
    pn_len: usize,
    remainder_len: usize,
    out: &mut Vec<u8>,
) -> Result<usize, Error> {
    if !matches!(
        packet_type,
        PacketType::Initial | PacketType::ZeroRtt | PacketType::Handshake
    ) || dcid.len() > MAX_CID_LEN
        || scid.len() > MAX_CID_LEN
        || !(1..=4).contains(&pn_len)
    {
        return Err(Error::InvalidState);
    }

    out.push(0xc0 | (packet_type.long_type_bits() << 4) | (pn_len as u8 - 1));
    out.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid);
    out.push(scid.len() as u8);
    out.extend_from_slice(scid);
    if packet_type == PacketType::Initial {
        push_varint(token.len() as u64, out)?;
        out.extend_from_slice(token);
    }
    // Fixed two-byte form, so padding never moves the packet number.
    let len = u16::try_from(remainder_len)
        .ok()
        .filter(|l| *l <= 0x3fff)
        .ok_or(Error::InvalidState)?;
    out.extend_from_slice(&(0x4000 | len).to_be_bytes());
    Ok(out.len())
}

/// Append a short header: first byte plus destination connection ID.
///
/// Returns the offset, within `out`, where the packet number goes.
pub fn encode_short_header(
    dcid: &[u8],
    key_phase: bool,
    pn_len: usize,
    out: &mut Vec<u8>,
) -> Result<usize, Error> {
    if !(1..=4).contains(&pn_len) {
        return Err(Error::InvalidState);
    }
    out.push(0x40 | (u8::from(key_phase) << 2) | (pn_len as u8 - 1));
    out.extend_from_slice(dcid);
    Ok(out.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn initial_header_roundtrip() {
        let mut buf = Vec::new();
        let pn_offset = encode_long_header(
            PacketType::Initial,
            &[1, 2, 3, 4],
            &[0x0a, 0x0b],
            &[0xff, 0xfe],
            2,
            40,
            &mut buf,
        )
        .unwrap();
        buf.resize(pn_offset + 40, 0);

        let hdr = decode_header(&buf, 8).unwrap();
        assert_eq!(hdr.packet_type, PacketType::Initial);
        assert_eq!(hdr.version, QUIC_VERSION_1);
        assert_eq!(hdr.dcid, &[1, 2, 3, 4]);
        assert_eq!(hdr.scid, &[0x0a, 0x0b]);
        assert_eq!(hdr.token, &[0xff, 0xfe]);
        assert_eq!(hdr.pn_offset, pn_offset);
        assert_eq!(hdr.packet_len, buf.len());
        assert_eq!(hdr.first_byte & 0x03, 1);
    }

    #[test]
    fn handshake_header_length_delimits_packet() {
        let mut buf = Vec::new();
        let pn_offset =
            encode_long_header(PacketType::Handshake, &[9; 8], &[], &[], 1, 20, &mut buf).unwrap();
        buf.resize(pn_offset + 20, 0);
        // trailing bytes belong to the next coalesced packet
        buf.extend_from_slice(&[0x40, 0, 0]);

        let hdr = decode_header(&buf, 8).unwrap();
        assert_eq!(hdr.packet_type, PacketType::Handshake);
        assert_eq!(hdr.packet_len, pn_offset + 20);
    }

    #[test]
    fn short_header_uses_local_cid_length() {
        let mut buf = Vec::new();
        let pn_offset = encode_short_header(&[7; 8], true, 3, &mut buf).unwrap();
        buf.extend_from_slice(&[0; 24]);
        let hdr = decode_header(&buf, 8).unwrap();
        assert_eq!(hdr.packet_type, PacketType::OneRtt);
        assert_eq!(hdr.dcid, &[7; 8]);
        assert_eq!(hdr.pn_offset, pn_offset);
        assert_eq!(hdr.first_byte & 0x04, 0x04);
    }

    #[test]
    fn version_negotiation_lists_versions() {
        let mut buf = vec![0x80, 0, 0, 0, 0, 4, 1, 2, 3, 4, 2, 0x0a, 0x0b];
        buf.extend_from_slice(&0xff00_001du32.to_be_bytes());
        buf.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
        let hdr = decode_header(&buf, 8).unwrap();
        assert_eq!(hdr.packet_type, PacketType::VersionNegotiation);
        assert!(hdr.offers_version(QUIC_VERSION_1));
        assert!(!hdr.offers_version(2));
    }

    #[test]
    fn short_datagrams_are_malformed() {
        assert_eq!(decode_header(&[], 8), Err(Error::MalformedPacket));
        assert_eq!(decode_header(&[0xc0, 0, 0, 0], 8), Err(Error::MalformedPacket));
        // short header shorter than its connection ID
        assert_eq!(decode_header(&[0x40, 1, 2], 8), Err(Error::MalformedPacket));
    }

    #[test]
    fn invalid_type_bytes_are_malformed() {
        // fixed bit cleared on a short header
        assert_eq!(decode_header(&[0x00; 16], 4), Err(Error::MalformedPacket));
        // long header with fixed bit cleared
        let mut buf = Vec::new();
        encode_long_header(PacketType::Handshake, &[1], &[2], &[], 1, 4, &mut buf).unwrap();
        buf.resize(buf.len() + 4, 0);
        buf[0] &= !0x40;
        assert_eq!(decode_header(&buf, 1), Err(Error::MalformedPacket));
    }

    #[test]
    fn length_past_datagram_is_malformed() {
        let mut buf = Vec::new();
        encode_long_header(PacketType::Handshake, &[1], &[2], &[], 1, 100, &mut buf).unwrap();
        buf.resize(buf.len() + 10, 0);
        assert_eq!(decode_header(&buf, 1), Err(Error::MalformedPacket));
    }

    #[test]
    fn oversized_connection_id_is_malformed() {
        let mut buf = vec![0xc0, 0, 0, 0, 1, 21];
        buf.extend_from_slice(&[0; 40]);
        assert_eq!(decode_header(&buf, 8), Err(Error::MalformedPacket));
    }
}
