//! Per-connection wire state on the server side.
//!
//! Sockets are polled, never awaited: the control loop visits every
//! connection once per tick and absence of data is not an error. Admission
//! traffic is plaintext CPP; everything after the key delivery is CPPS.

use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::crypto::{PeerKey, SessionKey};
use crate::error::{Error, Result};
use crate::protocol::frame::FrameReader;
use crate::protocol::payload::Payload;
use crate::protocol::secure::{self, EnvelopeReader, MAX_DECRYPT_FAILURES};

/// Outcome of polling an active member's connection for one tick.
pub enum Polled {
    /// Nothing to read this tick.
    Idle,
    /// One decoded payload.
    Message(Payload),
    /// The connection is gone: EOF, transport error, a poisoned stream, or
    /// too many consecutive authentication failures.
    Closed,
}

/// Drain whatever bytes are ready into `sink`; `Ok(false)` = peer closed.
fn try_fill(stream: &TcpStream, sink: &mut dyn FnMut(&[u8])) -> std::io::Result<bool> {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.try_read(&mut chunk) {
            Ok(0) => return Ok(false),
            Ok(n) => sink(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) => return Err(e),
        }
    }
}

/// An admitted member's encrypted connection.
pub struct SecureConn {
    stream: TcpStream,
    reader: EnvelopeReader,
    decrypt_failures: u32,
}

impl SecureConn {
    /// Wrap a stream whose admission handshake has completed.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            reader: EnvelopeReader::new(),
            decrypt_failures: 0,
        }
    }

    /// Non-blocking poll for at most one payload.
    ///
    /// A peer that sends a final frame and closes in the same instant must
    /// still have that frame delivered, so buffered envelopes drain before
    /// the close is reported.
    pub fn poll(&mut self, key: &SessionKey) -> Polled {
        let reader = &mut self.reader;
        let stream_open = match try_fill(&self.stream, &mut |bytes| reader.push(bytes)) {
            Ok(open) => open,
            Err(e) => {
                debug!(error = %e, "transport error");
                false
            }
        };

        let body = match self.reader.try_envelope() {
            Ok(Some(body)) => body,
            Ok(None) => {
                return if stream_open {
                    Polled::Idle
                } else {
                    Polled::Closed
                };
            }
            Err(e) => {
                debug!(error = %e, "poisoned stream");
                return Polled::Closed;
            }
        };

        match secure::open(key, &body) {
            Ok(Some(payload)) => {
                self.decrypt_failures = 0;
                Polled::Message(payload)
            }
            Ok(None) => {
                // authenticated but unrecognized: ignore silently
                self.decrypt_failures = 0;
                Polled::Idle
            }
            Err(Error::Crypto(_)) => {
                self.decrypt_failures += 1;
                if self.decrypt_failures >= MAX_DECRYPT_FAILURES {
                    warn!(
                        failures = self.decrypt_failures,
                        "dropping desynchronized connection"
                    );
                    Polled::Closed
                } else {
                    Polled::Idle
                }
            }
            Err(_) => Polled::Idle, // malformed inner frame: dropped silently
        }
    }

    /// Seal and send one payload.
    pub async fn send(&mut self, key: &SessionKey, payload: &Payload) -> Result<()> {
        let envelope = secure::seal(key, payload)?;
        self.stream.write_all(&envelope).await?;
        Ok(())
    }
}

/// Outcome of polling a pending (not yet admitted) connection.
pub enum AdmissionPoll {
    /// Still waiting for handshake frames.
    Waiting,
    /// Handshake frames complete: name and public key received.
    Ready {
        /// Requested member name, whitespace-trimmed.
        name: String,
        /// The client's RSA public key.
        key: PeerKey,
    },
    /// The connection closed or misbehaved; discard it.
    Failed,
}

/// A connection partway through the admission handshake.
///
/// The client sends its name and then its public-key PEM, both as
/// plaintext MSG frames. Anything else is a protocol violation.
pub struct PendingConn {
    stream: TcpStream,
    reader: FrameReader,
    name: Option<String>,
    accepted_at: Instant,
}

impl PendingConn {
    /// Track a freshly accepted connection.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            reader: FrameReader::new(),
            name: None,
            accepted_at: Instant::now(),
        }
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Non-blocking poll for the two admission frames.
    pub fn poll(&mut self) -> AdmissionPoll {
        let reader = &mut self.reader;
        let stream_open = match try_fill(&self.stream, &mut |bytes| reader.push(bytes)) {
            Ok(open) => open,
            Err(_) => false,
        };

        loop {
            let (tag_byte, body) = match self.reader.try_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return if stream_open {
                        AdmissionPoll::Waiting
                    } else {
                        AdmissionPoll::Failed
                    };
                }
                Err(_) => return AdmissionPoll::Failed,
            };
            let text = match Payload::decode(tag_byte, &body) {
                Ok(Some(Payload::Msg(text))) => text,
                _ => return AdmissionPoll::Failed,
            };
            match self.name.take() {
                None => self.name = Some(text.trim().to_string()),
                Some(name) => {
                    return match PeerKey::from_pem(&text) {
                        Ok(key) => AdmissionPoll::Ready { name, key },
                        Err(e) => {
                            debug!(error = %e, "invalid public key during admission");
                            AdmissionPoll::Failed
                        }
                    };
                }
            }
        }
    }

    /// Send a plaintext CPP frame; admission replies are unencrypted.
    pub async fn send_plain(&mut self, payload: &Payload) -> Result<()> {
        self.stream.write_all(&payload.encode()?).await?;
        Ok(())
    }

    /// Surrender the stream once admission succeeds.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
