//! Authenticated encryption for the CPPS envelope.
//!
//! AES-128-EAX with a 16-byte nonce and a 16-byte tag. The tag is kept
//! detached because the envelope lays it out between the nonce and the
//! ciphertext on the wire.
//!
//! One session key serves the whole server process: it is generated once at
//! startup and handed to each client at admission, so compromising any one
//! client's private key exposes the traffic of all members. That is a known
//! property of the protocol, preserved deliberately for compatibility.

use std::fmt;

use aes::Aes128;
use eax::aead::generic_array::GenericArray;
use eax::aead::{AeadInPlace, KeyInit};
use eax::Eax;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the symmetric session key in bytes (AES-128).
pub const KEY_SIZE: usize = 16;

/// Size of the nonce in bytes.
pub const NONCE_SIZE: usize = 16;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

type Aes128Eax = Eax<Aes128>;

/// A nonce for AEAD encryption.
///
/// Must be unique per key; every sealed envelope draws a fresh random one.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// The process-wide symmetric session key.
///
/// Zeroized on drop to keep key material from persisting in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Restore from raw bytes, e.g. after the admission exchange.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("bad session key length".into()))?;
        Ok(Self(bytes))
    }

    /// The raw bytes.
    ///
    /// # Security
    /// Handle with care - this exposes secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Encrypt `buffer` in place, returning the detached tag.
pub fn encrypt_detached(
    key: &SessionKey,
    nonce: &Nonce,
    buffer: &mut Vec<u8>,
) -> Result<[u8; TAG_SIZE]> {
    let cipher = Aes128Eax::new(GenericArray::from_slice(key.as_bytes()));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce.as_bytes()), b"", buffer)
        .map_err(|_| Error::Crypto("encryption failed".into()))?;
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Verify `tag` and decrypt `buffer` in place.
///
/// # Security
///
/// Authentication runs before any plaintext is released, and the error is
/// generic to prevent oracle attacks.
pub fn decrypt_detached(
    key: &SessionKey,
    nonce: &Nonce,
    buffer: &mut Vec<u8>,
    tag: &[u8],
) -> Result<()> {
    if tag.len() != TAG_SIZE {
        return Err(Error::Crypto("decryption failed".into()));
    }
    let cipher = Aes128Eax::new(GenericArray::from_slice(key.as_bytes()));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce.as_bytes()),
            b"",
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| Error::Crypto("decryption failed".into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() {
        let key = SessionKey::generate();
        let nonce = Nonce::random();
        let mut buffer = b"a private word".to_vec();

        let tag = encrypt_detached(&key, &nonce, &mut buffer).expect("encrypt");
        assert_ne!(buffer, b"a private word");

        decrypt_detached(&key, &nonce, &mut buffer, &tag).expect("decrypt");
        assert_eq!(buffer, b"a private word");
    }

    #[test]
    fn wrong_key_fails() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let nonce = Nonce::random();
        let mut buffer = b"secret".to_vec();

        let tag = encrypt_detached(&key, &nonce, &mut buffer).expect("encrypt");
        assert!(decrypt_detached(&other, &nonce, &mut buffer, &tag).is_err());
    }

    #[test]
    fn wrong_nonce_fails() {
        let key = SessionKey::generate();
        let nonce = Nonce::random();
        let mut buffer = b"secret".to_vec();

        let tag = encrypt_detached(&key, &nonce, &mut buffer).expect("encrypt");
        assert!(decrypt_detached(&key, &Nonce::random(), &mut buffer, &tag).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SessionKey::generate();
        let nonce = Nonce::random();
        let mut buffer = b"secret".to_vec();

        let tag = encrypt_detached(&key, &nonce, &mut buffer).expect("encrypt");
        buffer[0] ^= 0xFF;
        assert!(decrypt_detached(&key, &nonce, &mut buffer, &tag).is_err());
    }

    #[test]
    fn tampered_tag_fails() {
        let key = SessionKey::generate();
        let nonce = Nonce::random();
        let mut buffer = b"secret".to_vec();

        let mut tag = encrypt_detached(&key, &nonce, &mut buffer).expect("encrypt");
        tag[0] ^= 0x01;
        assert!(decrypt_detached(&key, &nonce, &mut buffer, &tag).is_err());
    }

    #[test]
    fn session_key_rejects_bad_length() {
        assert!(SessionKey::from_bytes(&[0u8; 15]).is_err());
        assert!(SessionKey::from_bytes(&[0u8; 16]).is_ok());
    }

    #[test]
    fn session_key_debug_is_redacted() {
        let key = SessionKey::generate();
        assert_eq!(format!("{key:?}"), "SessionKey([REDACTED])");
    }
}
