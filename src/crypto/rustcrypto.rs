//! RustCrypto-backed implementations of the QUIC crypto traits.

#[cfg(any(feature = "rustcrypto-aes", feature = "rustcrypto-chacha"))]
use alloc::vec::Vec;

#[cfg(any(feature = "rustcrypto-aes", feature = "rustcrypto-chacha"))]
use crate::crypto::{Aead as AeadTrait, CryptoProvider, HeaderProtection};
use crate::crypto::Hkdf as HkdfTrait;
use crate::error::Error;

// ---- HKDF-SHA256 ----

/// HKDF using SHA-256 (via the `hkdf` crate).
pub struct HkdfSha256;

impl HkdfTrait for HkdfSha256 {
    const HASH_LEN: usize = 32;

    fn extract(&self, salt: &[u8], ikm: &[u8], prk: &mut [u8]) {
        let (out, _) = hkdf::Hkdf::<sha2::Sha256>::extract(Some(salt), ikm);
        prk[..32].copy_from_slice(&out);
    }

    fn expand(&self, prk: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), Error> {
        let hk = hkdf::Hkdf::<sha2::Sha256>::from_prk(prk).map_err(|_| Error::Crypto)?;
        hk.expand(info, okm).map_err(|_| Error::Crypto)
    }
}

/// Split the trailing 16-byte tag off `payload`.
#[cfg(any(feature = "rustcrypto-aes", feature = "rustcrypto-chacha"))]
fn split_tag(payload: &mut Vec<u8>) -> Result<[u8; 16], Error> {
    let body_len = payload.len().checked_sub(16).ok_or(Error::DecryptionFailure)?;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&payload[body_len..]);
    payload.truncate(body_len);
    Ok(tag)
}

// ---- AES-128-GCM AEAD ----

/// AES-128-GCM AEAD implementation.
#[cfg(feature = "rustcrypto-aes")]
pub struct Aes128GcmAead {
    cipher: aes_gcm::Aes128Gcm,
}

#[cfg(feature = "rustcrypto-aes")]
impl AeadTrait for Aes128GcmAead {
    const KEY_LEN: usize = 16;

    fn seal(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Vec<u8>) -> Result<(), Error> {
        use aes_gcm::aead::AeadInPlace;

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce.into(), aad, payload)
            .map_err(|_| Error::Crypto)?;
        payload.extend_from_slice(&tag);
        Ok(())
    }

    fn open(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Vec<u8>) -> Result<(), Error> {
        use aes_gcm::aead::AeadInPlace;

        let tag = split_tag(payload)?;
        self.cipher
            .decrypt_in_place_detached(nonce.into(), aad, payload, &tag.into())
            .map_err(|_| Error::DecryptionFailure)
    }
}

// ---- ChaCha20-Poly1305 AEAD ----

/// ChaCha20-Poly1305 AEAD implementation.
#[cfg(feature = "rustcrypto-chacha")]
pub struct ChaCha20Poly1305Aead {
    cipher: chacha20poly1305::ChaCha20Poly1305,
}

#[cfg(feature = "rustcrypto-chacha")]
impl AeadTrait for ChaCha20Poly1305Aead {
    const KEY_LEN: usize = 32;

    fn seal(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Vec<u8>) -> Result<(), Error> {
        use chacha20poly1305::aead::AeadInPlace;

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce.into(), aad, payload)
            .map_err(|_| Error::Crypto)?;
        payload.extend_from_slice(&tag);
        Ok(())
    }

    fn open(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Vec<u8>) -> Result<(), Error> {
        use chacha20poly1305::aead::AeadInPlace;

        let tag = split_tag(payload)?;
        self.cipher
            .decrypt_in_place_detached(nonce.into(), aad, payload, &tag.into())
            .map_err(|_| Error::DecryptionFailure)
    }
}

// ---- AES Header Protection ----

/// AES-128-ECB header protection.
#[cfg(feature = "rustcrypto-aes")]
pub struct AesHeaderProtection {
    cipher: aes::Aes128,
}

#[cfg(feature = "rustcrypto-aes")]
impl HeaderProtection for AesHeaderProtection {
    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        use aes::cipher::BlockEncrypt;
        use aes::Block;

        let mut block = Block::clone_from_slice(&sample[..16]);
        self.cipher.encrypt_block(&mut block);
        let mut mask = [0u8; 5];
        mask.copy_from_slice(&block[..5]);
        mask
    }
}

// ---- ChaCha20 Header Protection ----

/// ChaCha20 header protection: the sample supplies the block counter
/// (first 4 bytes, little endian) and the nonce (remaining 12).
#[cfg(feature = "rustcrypto-chacha")]
pub struct ChaChaHeaderProtection {
    key: [u8; 32],
}

#[cfg(feature = "rustcrypto-chacha")]
impl HeaderProtection for ChaChaHeaderProtection {
    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

        let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&sample[4..16]);

        let mut cipher = chacha20::ChaCha20::new((&self.key).into(), (&nonce).into());
        cipher.seek(u64::from(counter) * 64);

        let mut mask = [0u8; 5];
        cipher.apply_keystream(&mut mask);
        mask
    }
}

// ---- CryptoProvider bundles ----

/// AES-128-GCM cipher suite provider (TLS_AES_128_GCM_SHA256).
#[cfg(feature = "rustcrypto-aes")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128GcmProvider;

#[cfg(feature = "rustcrypto-aes")]
impl CryptoProvider for Aes128GcmProvider {
    type Aead = Aes128GcmAead;
    type Hkdf = HkdfSha256;
    type HeaderProtection = AesHeaderProtection;

    fn aead(&self, key: &[u8]) -> Result<Self::Aead, Error> {
        use aes_gcm::KeyInit;
        let cipher = aes_gcm::Aes128Gcm::new_from_slice(key).map_err(|_| Error::Crypto)?;
        Ok(Aes128GcmAead { cipher })
    }

    fn hkdf(&self) -> Self::Hkdf {
        HkdfSha256
    }

    fn header_protection(&self, key: &[u8]) -> Result<Self::HeaderProtection, Error> {
        use aes::cipher::KeyInit;
        let cipher = aes::Aes128::new_from_slice(key).map_err(|_| Error::Crypto)?;
        Ok(AesHeaderProtection { cipher })
    }
}

/// ChaCha20-Poly1305 cipher suite provider (TLS_CHACHA20_POLY1305_SHA256).
#[cfg(feature = "rustcrypto-chacha")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaCha20Provider;

#[cfg(feature = "rustcrypto-chacha")]
impl CryptoProvider for ChaCha20Provider {
    type Aead = ChaCha20Poly1305Aead;
    type Hkdf = HkdfSha256;
    type HeaderProtection = ChaChaHeaderProtection;

    fn aead(&self, key: &[u8]) -> Result<Self::Aead, Error> {
        use chacha20poly1305::KeyInit;
        let cipher =
            chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::Crypto)?;
        Ok(ChaCha20Poly1305Aead { cipher })
    }

    fn hkdf(&self) -> Self::Hkdf {
        HkdfSha256
    }

    fn header_protection(&self, key: &[u8]) -> Result<Self::HeaderProtection, Error> {
        let key: [u8; 32] = key.try_into().map_err(|_| Error::Crypto)?;
        Ok(ChaChaHeaderProtection { key })
    }
}
