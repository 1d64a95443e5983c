//! QUIC packet header types and codec.
//!
//! This module handles the outer QUIC packet structure: headers, packet
//! numbers, and coalescing. It does NOT handle encryption or decryption;
//! the crypto epoch manager removes header protection and opens payloads.

pub mod coalesce;
pub mod header;
pub mod number;

pub use coalesce::CoalescedPackets;
pub use header::{decode_header, encode_long_header, encode_short_header};
pub use number::{decode_pn, pn_length, push_pn};

use crate::crypto::Epoch;

/// QUIC v1 version number (RFC 9000).
pub const QUIC_VERSION_1: u32 = 0x00000001;

/// Maximum connection ID length (RFC 9000).
pub const MAX_CID_LEN: usize = 20;

/// Minimum size of a datagram carrying a client Initial (RFC 9000 §14.1).
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// Header protection samples 16 bytes starting 4 bytes past the packet number.
pub const HP_SAMPLE_LEN: usize = 16;

/// Packet type as carried in the first byte (and version field) of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    /// Short header.
    OneRtt,
}

impl PacketType {
    /// Encryption epoch protecting packets of this type.
    pub fn epoch(self) -> Option<Epoch> {
        match self {
            PacketType::Initial => Some(Epoch::Initial),
            PacketType::ZeroRtt => Some(Epoch::ZeroRtt),
            PacketType::Handshake => Some(Epoch::Handshake),
            PacketType::OneRtt => Some(Epoch::OneRtt),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }

    /// Packet number space, for types that carry a packet number.
    pub fn space(self) -> Option<PacketSpace> {
        self.epoch().map(Epoch::space)
    }

    fn long_type_bits(self) -> u8 {
        match self {
            PacketType::Initial => 0b00,
            PacketType::ZeroRtt => 0b01,
            PacketType::Handshake => 0b10,
            _ => 0b11,
        }
    }
}

/// Packet number space (RFC 9000 §12.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketSpace {
    Initial = 0,
    Handshake = 1,
    /// Shared by 0-RTT and 1-RTT packets.
    Application = 2,
}

impl PacketSpace {
    pub const ALL: [PacketSpace; 3] = [
        PacketSpace::Initial,
        PacketSpace::Handshake,
        PacketSpace::Application,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A decoded packet header, still under header protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader<'a> {
    pub packet_type: PacketType,
    /// First byte as received (protected bits still masked).
    pub first_byte: u8,
    /// Zero for short headers.
    pub version: u32,
    pub dcid: &'a [u8],
    /// Empty for short headers.
    pub scid: &'a [u8],
    /// Initial token, or the Retry token (integrity tag stripped).
    pub token: &'a [u8],
    /// Raw 4-byte version list of a Version Negotiation packet.
    pub supported_versions: &'a [u8],
    /// Offset of the (protected) packet number from the start of the packet.
    pub pn_offset: usize,
    /// Total length of this packet within the datagram.
    pub packet_len: usize,
}

impl PacketHeader<'_> {
    pub fn is_long(&self) -> bool {
        self.first_byte & 0x80 != 0
    }

    /// Whether `version` appears in a Version Negotiation version list.
    pub fn offers_version(&self, version: u32) -> bool {
        self.supported_versions
            .chunks_exact(4)
            .any(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]) == version)
    }
}
