//! Cryptographic traits and packet protection for QUIC (RFC 9001).
//!
//! QUIC needs three primitives: AEAD for payloads, HKDF for expanding
//! traffic secrets into keys, and a header protection cipher. The
//! [`CryptoProvider`] trait bundles them for one cipher suite so backends
//! are pluggable (software via RustCrypto, or hardware-accelerated).
//!
//! [`EpochManager`] owns the per-epoch keys of a connection and performs
//! the actual seal/open and header protection work.

pub mod epoch;
pub mod key_schedule;
pub mod rustcrypto;

pub use epoch::{EpochManager, Unprotected};

use alloc::vec::Vec;

use crate::error::Error;
use crate::packet::PacketSpace;

/// Encryption epoch: one protection level with its own keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl Epoch {
    pub const ALL: [Epoch; 4] = [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::OneRtt];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Packet number space used by packets of this epoch.
    pub const fn space(self) -> PacketSpace {
        match self {
            Epoch::Initial => PacketSpace::Initial,
            Epoch::Handshake => PacketSpace::Handshake,
            Epoch::ZeroRtt | Epoch::OneRtt => PacketSpace::Application,
        }
    }
}

/// Which half of a key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Keys protecting packets we send.
    Send,
    /// Keys opening packets we receive.
    Receive,
}

/// A TLS traffic secret handed over by the handshake engine.
///
/// Up to 48 bytes (SHA-384 suites); SHA-256 suites use 32.
pub type TrafficSecret = heapless::Vec<u8, 48>;

/// Authenticated Encryption with Associated Data.
///
/// QUIC mandates AES-128-GCM; ChaCha20-Poly1305 is preferred on targets
/// without AES hardware.
pub trait Aead {
    /// Key length in bytes.
    const KEY_LEN: usize;
    /// Authentication tag length in bytes (16 for every QUIC suite).
    const TAG_LEN: usize = 16;

    /// Encrypt `payload` in place and append the tag.
    fn seal(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Vec<u8>) -> Result<(), Error>;

    /// Verify and decrypt `payload` (ciphertext plus tag) in place,
    /// truncating the tag.
    fn open(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Vec<u8>) -> Result<(), Error>;
}

/// Header protection cipher.
///
/// Produces a 5-byte mask from a 16-byte ciphertext sample: `mask[0]`
/// covers the low bits of the first byte, `mask[1..5]` the packet number.
pub trait HeaderProtection {
    fn mask(&self, sample: &[u8]) -> [u8; 5];
}

/// HMAC-based Key Derivation Function (RFC 5869).
pub trait Hkdf {
    /// Hash output length in bytes (e.g., 32 for SHA-256).
    const HASH_LEN: usize;

    /// HKDF-Extract: derive a pseudorandom key from salt and input keying material.
    fn extract(&self, salt: &[u8], ikm: &[u8], prk: &mut [u8]);

    /// HKDF-Expand: expand a pseudorandom key with info into output keying material.
    fn expand(&self, prk: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), Error>;
}

/// Bundle of cryptographic primitives for one cipher suite.
pub trait CryptoProvider {
    type Aead: Aead;
    type Hkdf: Hkdf;
    type HeaderProtection: HeaderProtection;

    /// Create an AEAD instance from a key.
    fn aead(&self, key: &[u8]) -> Result<Self::Aead, Error>;

    /// Get an HKDF instance for key derivation.
    fn hkdf(&self) -> Self::Hkdf;

    /// Create a header protection cipher from a key.
    fn header_protection(&self, key: &[u8]) -> Result<Self::HeaderProtection, Error>;

    /// Header protection key length; AES suites use 16, ChaCha20 uses 32.
    fn header_protection_key_len(&self) -> usize {
        core::cmp::max(<Self::Aead as Aead>::KEY_LEN, 16)
    }
}

/// AEAD key plus IV for one direction of one key phase.
pub struct PacketKey<A: Aead> {
    pub aead: A,
    /// Nonce base, XORed with the packet number to form the per-packet nonce.
    pub iv: [u8; 12],
}

impl<A: Aead> PacketKey<A> {
    /// The AEAD nonce for `packet_number`: the IV with the packet number
    /// XORed into its last eight bytes.
    pub fn nonce(&self, packet_number: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        for (n, p) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }
}
