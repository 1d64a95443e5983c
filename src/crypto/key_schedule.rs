//! QUIC key derivation (RFC 9001 §5).
//!
//! Traffic secrets come from the handshake engine (or, for Initial, from the
//! client's first destination connection ID). This module expands them into
//! AEAD keys, IVs and header protection keys.

use crate::crypto::{Aead, CryptoProvider, Hkdf, PacketKey, TrafficSecret};
use crate::error::Error;

/// QUIC v1 Initial salt (RFC 9001 §5.2).
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Largest HkdfLabel structure any QUIC label needs.
const MAX_LABEL_INFO: usize = 80;

/// HKDF-Expand-Label (RFC 8446 §7.1) with the "tls13 " prefix.
///
/// Fills `out` entirely; its length is the requested output length.
pub fn hkdf_expand_label<H: Hkdf>(
    hkdf: &H,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    const PREFIX: &[u8] = b"tls13 ";
    let full_label_len = PREFIX.len() + label.len();
    let info_len = 2 + 1 + full_label_len + 1 + context.len();
    if info_len > MAX_LABEL_INFO {
        return Err(Error::Crypto);
    }

    let mut info = [0u8; MAX_LABEL_INFO];
    info[..2].copy_from_slice(&(out.len() as u16).to_be_bytes());
    info[2] = full_label_len as u8;
    info[3..3 + PREFIX.len()].copy_from_slice(PREFIX);
    info[3 + PREFIX.len()..3 + full_label_len].copy_from_slice(label);
    info[3 + full_label_len] = context.len() as u8;
    info[4 + full_label_len..info_len].copy_from_slice(context);

    hkdf.expand(secret, &info[..info_len], out)
}

fn secret_of_len(len: usize) -> Result<TrafficSecret, Error> {
    let mut secret = TrafficSecret::new();
    secret.resize(len, 0).map_err(|_| Error::Crypto)?;
    Ok(secret)
}

/// Derive the `(client, server)` Initial secrets from the client's first
/// Destination Connection ID.
pub fn initial_secrets<H: Hkdf>(hkdf: &H, dcid: &[u8]) -> Result<(TrafficSecret, TrafficSecret), Error> {
    let mut initial_secret = [0u8; 48];
    hkdf.extract(&INITIAL_SALT_V1, dcid, &mut initial_secret[..H::HASH_LEN]);
    let prk = &initial_secret[..H::HASH_LEN];

    let mut client = secret_of_len(H::HASH_LEN)?;
    let mut server = secret_of_len(H::HASH_LEN)?;
    hkdf_expand_label(hkdf, prk, b"client in", &[], &mut client)?;
    hkdf_expand_label(hkdf, prk, b"server in", &[], &mut server)?;
    Ok((client, server))
}

/// Next-generation 1-RTT secret for a key update (RFC 9001 §6.1).
pub fn next_generation_secret<H: Hkdf>(hkdf: &H, current: &[u8]) -> Result<TrafficSecret, Error> {
    let mut next = secret_of_len(current.len())?;
    hkdf_expand_label(hkdf, current, b"quic ku", &[], &mut next)?;
    Ok(next)
}

/// Expand a traffic secret into raw key, IV and header protection key bytes.
pub fn expand_packet_keys<H: Hkdf>(
    hkdf: &H,
    secret: &[u8],
    key: &mut [u8],
    iv: &mut [u8; 12],
    hp_key: &mut [u8],
) -> Result<(), Error> {
    hkdf_expand_label(hkdf, secret, b"quic key", &[], key)?;
    hkdf_expand_label(hkdf, secret, b"quic iv", &[], iv)?;
    hkdf_expand_label(hkdf, secret, b"quic hp", &[], hp_key)?;
    Ok(())
}

/// Build the packet key and header protection cipher for one direction.
pub fn derive_keys<C: CryptoProvider>(
    provider: &C,
    secret: &[u8],
) -> Result<(PacketKey<C::Aead>, C::HeaderProtection), Error> {
    let key_len = <C::Aead as Aead>::KEY_LEN;
    let hp_len = provider.header_protection_key_len();
    let mut key = [0u8; 32];
    let mut iv = [0u8; 12];
    let mut hp = [0u8; 32];
    expand_packet_keys(&provider.hkdf(), secret, &mut key[..key_len], &mut iv, &mut hp[..hp_len])?;

    let packet_key = PacketKey {
        aead: provider.aead(&key[..key_len])?,
        iv,
    };
    Ok((packet_key, provider.header_protection(&hp[..hp_len])?))
}

/// Build only the packet key (key updates keep the header protection key).
pub fn derive_packet_key<C: CryptoProvider>(
    provider: &C,
    secret: &[u8],
) -> Result<PacketKey<C::Aead>, Error> {
    let key_len = <C::Aead as Aead>::KEY_LEN;
    let mut key = [0u8; 32];
    let mut iv = [0u8; 12];
    let hkdf = provider.hkdf();
    hkdf_expand_label(&hkdf, secret, b"quic key", &[], &mut key[..key_len])?;
    hkdf_expand_label(&hkdf, secret, b"quic iv", &[], &mut iv)?;
    Ok(PacketKey {
        aead: provider.aead(&key[..key_len])?,
        iv,
    })
}
