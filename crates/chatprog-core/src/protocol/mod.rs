//! CPP wire protocol and its CPPS secure variant.
//!
//! ## Plaintext frame
//!
//! ```text
//! ┌─────────┬──────────┬───────────────────┐
//! │  Type   │  Length  │     Payload       │
//! │ (1 byte)│ (4 bytes)│    (variable)     │
//! └─────────┴──────────┴───────────────────┘
//! ```
//!
//! Length is big-endian and counts exactly the payload bytes. A frame with
//! a length exceeding the available stream bytes is read to completion or
//! the connection closes; there are no short reads.
//!
//! ## Secure envelope (CPPS)
//!
//! ```text
//! ┌──────────┬───────────┬───────────┬────────────┐
//! │ TotalLen │   Nonce   │    Tag    │ Ciphertext │
//! │ (4 bytes)│ (16 bytes)│ (16 bytes)│ (variable) │
//! └──────────┴───────────┴───────────┴────────────┘
//! ```
//!
//! The decrypted ciphertext is a complete plaintext frame. Authentication
//! is verified before any payload byte is interpreted; a failed tag check
//! drops the message, never the connection loop.

pub mod frame;
pub mod payload;
pub mod secure;

pub use frame::{read_frame, FrameHeader, FrameReader, HEADER_SIZE};
pub use payload::{
    tag, AttachmentId, Command, CommandKind, FileAttachRecv, Payload, ServerMsg,
};
pub use secure::{
    open, read_envelope, seal, EnvelopeReader, ENVELOPE_OVERHEAD, MAX_DECRYPT_FAILURES,
};
