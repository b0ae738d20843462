//! Cryptographic primitives for the chat protocol.
//!
//! - **AES-128-EAX**: authenticated encryption for the CPPS envelope
//! - **RSA-OAEP**: session-key delivery during admission
//!
//! All secret key material is zeroized on drop and redacted in `Debug`
//! output. No custom constructions: every primitive comes from an audited
//! RustCrypto implementation.

mod aead;
mod keys;

pub use aead::{
    decrypt_detached, encrypt_detached, Nonce, SessionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use keys::{Identity, PeerKey, RSA_KEY_BITS};
