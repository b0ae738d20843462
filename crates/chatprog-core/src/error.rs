//! Error types for the chat protocol and server.
//!
//! Display messages stay deliberately generic; the `String` payloads carry
//! detail for logs, never for the wire.

use thiserror::Error;

/// Core error type for chatprog operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Key parsing, generation, or sizing failed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Malformed or out-of-contract wire data.
    /// Callers drop the offending frame silently.
    #[error("protocol error")]
    Protocol(String),

    /// The server refused admission.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// No member with the given name exists in the roster.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using chatprog's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
