//! Client-side session: the admission handshake and the encrypted channel.
//!
//! Admission is plaintext CPP: the client sends its name, then its
//! public-key PEM, and the server answers with either the encrypted
//! session key (a BYTES frame) or a rejection notice (a SERVERMSG frame)
//! followed by a close. Everything after the key delivery is CPPS.

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::crypto::{Identity, SessionKey};
use crate::error::{Error, Result};
use crate::protocol::frame::read_frame;
use crate::protocol::payload::Payload;
use crate::protocol::secure::{self, MAX_DECRYPT_FAILURES};

/// An admitted, encrypted chat session.
pub struct Session {
    sender: SessionSender,
    receiver: SessionReceiver,
    name: String,
}

/// Connect to a chat server and perform the admission handshake.
pub async fn connect(host: &str, port: u16, name: &str, identity: &Identity) -> Result<Session> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream
        .write_all(&Payload::Msg(name.to_string()).encode()?)
        .await?;
    stream
        .write_all(&Payload::Msg(identity.public_key_pem()?).encode()?)
        .await?;

    let reply = match read_frame(&mut stream).await? {
        Some((tag_byte, body)) => Payload::decode(tag_byte, &body)?,
        None => return Err(Error::Rejected("connection closed during admission".into())),
    };
    let key = match reply {
        Some(Payload::Bytes(ciphertext)) => identity.decrypt_session_key(&ciphertext)?,
        Some(Payload::Server(msg)) => return Err(Error::Rejected(msg.msg)),
        _ => return Err(Error::Protocol("unexpected admission reply".into())),
    };
    debug!(name = %name, "session established");

    let (read_half, write_half) = stream.into_split();
    Ok(Session {
        sender: SessionSender {
            write_half,
            key: key.clone(),
        },
        receiver: SessionReceiver {
            read_half,
            key,
            decrypt_failures: 0,
        },
        name: name.to_string(),
    })
}

impl Session {
    /// The name this session was admitted under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seal and send one payload.
    pub async fn send(&mut self, payload: &Payload) -> Result<()> {
        self.sender.send(payload).await
    }

    /// Announce and upload a file attachment.
    pub async fn send_attachment(&mut self, filename: &str, data: Vec<u8>) -> Result<()> {
        self.sender
            .send(&Payload::FileAttachSend {
                filename: filename.to_string(),
            })
            .await?;
        self.sender.send(&Payload::Bytes(data)).await
    }

    /// Receive the next payload; `Ok(None)` means the connection ended.
    pub async fn receive(&mut self) -> Result<Option<Payload>> {
        self.receiver.receive().await
    }

    /// Split into independently owned sender and receiver halves, so a
    /// client can run a dedicated receive task.
    pub fn split(self) -> (SessionSender, SessionReceiver) {
        (self.sender, self.receiver)
    }

    /// Send the quit command and close the connection.
    pub async fn quit(mut self) -> Result<()> {
        self.sender.send(&Payload::quit()).await?;
        self.sender.write_half.shutdown().await?;
        Ok(())
    }
}

/// The sending half of a session.
pub struct SessionSender {
    write_half: OwnedWriteHalf,
    key: SessionKey,
}

impl SessionSender {
    /// Seal and send one payload.
    pub async fn send(&mut self, payload: &Payload) -> Result<()> {
        let envelope = secure::seal(&self.key, payload)?;
        self.write_half.write_all(&envelope).await?;
        Ok(())
    }
}

/// The receiving half of a session.
pub struct SessionReceiver {
    read_half: OwnedReadHalf,
    key: SessionKey,
    decrypt_failures: u32,
}

impl SessionReceiver {
    /// Receive the next payload; `Ok(None)` means the connection ended.
    ///
    /// Unrecognized and malformed inner frames are skipped silently.
    /// An authentication failure is a dropped message until
    /// [`MAX_DECRYPT_FAILURES`] consecutive ones mark the session
    /// desynchronized, which surfaces as `Error::Crypto`.
    pub async fn receive(&mut self) -> Result<Option<Payload>> {
        loop {
            let body = match secure::read_envelope(&mut self.read_half).await? {
                Some(body) => body,
                None => return Ok(None),
            };
            match secure::open(&self.key, &body) {
                Ok(Some(payload)) => {
                    self.decrypt_failures = 0;
                    return Ok(Some(payload));
                }
                Ok(None) => {
                    self.decrypt_failures = 0;
                }
                Err(Error::Crypto(detail)) => {
                    self.decrypt_failures += 1;
                    warn!(failures = self.decrypt_failures, "dropped unauthenticated message");
                    if self.decrypt_failures >= MAX_DECRYPT_FAILURES {
                        return Err(Error::Crypto(detail));
                    }
                }
                Err(Error::Protocol(detail)) => {
                    debug!(detail = %detail, "ignoring malformed frame");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
