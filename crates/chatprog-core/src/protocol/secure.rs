//! CPPS: the authenticated-encryption envelope around CPP frames.
//!
//! Wire layout: `total_len (u32 BE) || nonce (16) || tag (16) || ciphertext`,
//! with `total_len = 32 + len(ciphertext)`. The AEAD plaintext is a complete
//! plaintext frame, handed back to the frame codec after the tag verifies.
//!
//! A failed tag check is a dropped message, not a dropped connection: in a
//! non-blocking poll model one corrupted envelope must not kill a session.
//! Callers do track *consecutive* failures and tear the connection down at
//! [`MAX_DECRYPT_FAILURES`], since a desynchronized key never recovers.

use tokio::io::AsyncRead;

use crate::crypto::{decrypt_detached, encrypt_detached, Nonce, SessionKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::protocol::frame::{read_exact_or_eof, FrameHeader, HEADER_SIZE};
use crate::protocol::payload::Payload;
use crate::MAX_PAYLOAD_SIZE;

/// Envelope bytes beyond the ciphertext: nonce plus tag.
pub const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Consecutive authentication failures tolerated before a connection is
/// considered desynchronized and torn down.
pub const MAX_DECRYPT_FAILURES: u32 = 5;

/// Upper bound on a well-formed envelope body.
const MAX_ENVELOPE_LEN: usize = ENVELOPE_OVERHEAD + HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Seal a payload into a complete envelope with a fresh random nonce.
pub fn seal(key: &SessionKey, payload: &Payload) -> Result<Vec<u8>> {
    let mut plaintext = payload.encode()?;
    let nonce = Nonce::random();
    let tag = encrypt_detached(key, &nonce, &mut plaintext)?;

    let total = (ENVELOPE_OVERHEAD + plaintext.len()) as u32;
    let mut out = Vec::with_capacity(4 + total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&plaintext);
    Ok(out)
}

/// Open an envelope body (`nonce || tag || ciphertext`).
///
/// Authentication is verified before any payload byte is interpreted.
/// `Error::Crypto` marks a dropped message (the connection may live on);
/// `Ok(None)` marks an unrecognized inner type to be ignored silently.
pub fn open(key: &SessionKey, body: &[u8]) -> Result<Option<Payload>> {
    if body.len() < ENVELOPE_OVERHEAD {
        return Err(Error::Protocol("envelope too short".into()));
    }
    let nonce_bytes: [u8; NONCE_SIZE] = body[..NONCE_SIZE]
        .try_into()
        .map_err(|_| Error::Protocol("envelope too short".into()))?;
    let nonce = Nonce::from_bytes(nonce_bytes);
    let tag = &body[NONCE_SIZE..ENVELOPE_OVERHEAD];

    let mut plaintext = body[ENVELOPE_OVERHEAD..].to_vec();
    decrypt_detached(key, &nonce, &mut plaintext, tag)?;
    decode_plain_frame(&plaintext)
}

/// Decode a complete plaintext frame (header plus body).
fn decode_plain_frame(frame: &[u8]) -> Result<Option<Payload>> {
    let header = FrameHeader::from_bytes(frame)?;
    if frame.len() != HEADER_SIZE + header.length as usize {
        return Err(Error::Protocol("frame length mismatch".into()));
    }
    Payload::decode(header.tag, &frame[HEADER_SIZE..])
}

/// Read one envelope body from an async stream.
///
/// Returns `Ok(None)` when the peer closed the stream, at a boundary or
/// mid-envelope. An implausible length field poisons the stream.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    if read_exact_or_eof(reader, &mut len_bytes).await?.is_none() {
        return Ok(None);
    }
    let total = u32::from_be_bytes(len_bytes) as usize;
    if !(ENVELOPE_OVERHEAD..=MAX_ENVELOPE_LEN).contains(&total) {
        return Err(Error::Protocol("invalid envelope length".into()));
    }
    let mut body = vec![0u8; total];
    if read_exact_or_eof(reader, &mut body).await?.is_none() {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Incremental envelope reader for non-blocking streams.
#[derive(Default)]
pub struct EnvelopeReader {
    buffer: Vec<u8>,
}

impl EnvelopeReader {
    /// Create a new envelope reader.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Add received bytes to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract one complete envelope body.
    ///
    /// `Ok(None)` means more bytes are needed. An implausible length field
    /// clears the buffer and errors; the caller should drop the connection.
    pub fn try_envelope(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let total = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if !(ENVELOPE_OVERHEAD..=MAX_ENVELOPE_LEN).contains(&total) {
            self.buffer.clear();
            return Err(Error::Protocol("invalid envelope length".into()));
        }
        if self.buffer.len() < 4 + total {
            return Ok(None);
        }
        let envelope: Vec<u8> = self.buffer.drain(..4 + total).collect();
        Ok(Some(envelope[4..].to_vec()))
    }
}
