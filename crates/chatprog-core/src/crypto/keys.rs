//! RSA identities for the admission key exchange.
//!
//! Each client holds an RSA keypair. The public half travels to the server
//! as PKCS#1 PEM during admission, and the server answers with the session
//! key encrypted under it (OAEP over SHA-256). The protocol fixes the
//! modulus at 1024 bits - small by modern standards, kept for wire-level
//! compatibility.

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::crypto::aead::SessionKey;
use crate::error::{Error, Result};

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 1024;

/// A client identity: the RSA keypair presented at admission.
pub struct Identity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Export the public half as PKCS#1 PEM.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// The public half as a [`PeerKey`].
    pub fn peer_key(&self) -> PeerKey {
        PeerKey(self.public.clone())
    }

    /// Decrypt a session key received during admission.
    pub fn decrypt_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey> {
        let bytes = self
            .private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed".into()))?;
        SessionKey::from_bytes(&bytes)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("bits", &(self.public.size() * 8))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A peer's RSA public key, as received over the wire.
#[derive(Clone)]
pub struct PeerKey(RsaPublicKey);

impl PeerKey {
    /// Parse from PKCS#1 PEM text.
    pub fn from_pem(pem: &str) -> Result<Self> {
        RsaPublicKey::from_pkcs1_pem(pem)
            .map(Self)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// Export as PKCS#1 PEM.
    pub fn to_pem(&self) -> Result<String> {
        self.0
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// Encrypt the session key for delivery to this peer.
    pub fn encrypt_session_key(&self, key: &SessionKey) -> Result<Vec<u8>> {
        let mut rng = OsRng;
        self.0
            .encrypt(&mut rng, Oaep::new::<Sha256>(), key.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".into()))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({} bits)", self.0.size() * 8)
    }
}
