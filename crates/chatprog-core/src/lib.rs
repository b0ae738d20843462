//! # chatprog core library
//!
//! A multi-user text chat service speaking CPP (Chat Program Protocol), a
//! length-prefixed binary framing protocol, optionally wrapped in CPPS — an
//! authenticated-encryption envelope keyed by a session key that is exchanged
//! asymmetrically when a connection is admitted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          presentation (CLI, GUI, ...)        │
//! ├──────────────────────────────────────────────┤
//! │   server (roster, dispatch)   │    client    │
//! ├──────────────────────────────────────────────┤
//! │       protocol (CPP frames, CPPS envelope)   │
//! ├──────────────────────────────────────────────┤
//! │         crypto (AES-EAX, RSA-OAEP)           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The server runs a single control loop that owns all roster state and
//! polls every connection once per tick; a separate task blocks on `accept`
//! and only enqueues raw connections. Malformed frames are dropped silently,
//! unauthenticated envelopes are dropped messages, and per-connection errors
//! never abort the process.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame payload size in bytes.
///
/// Generous because file attachments travel as a single BYTES frame.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
