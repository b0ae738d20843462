//! Typed CPP payloads and their byte-exact codecs.
//!
//! The wire format of every payload kind is fixed by the protocol, so the
//! encoders and decoders here are written out explicitly instead of being
//! derived. Unknown type tags decode to "ignored" and callers drop the
//! frame silently.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::error::{Error, Result};
use crate::protocol::frame::encode_frame;

/// Wire values for payload type tags.
///
/// Bit 7 marks the command range. `0xA0..=0xBF` are one-argument commands,
/// `0xC0..` take no arguments, and TELL (`0x80`) is the sole two-argument
/// command, matched by exact equality before any mask test.
pub mod tag {
    /// Plain UTF-8 message.
    pub const MSG: u8 = 0;
    /// Named, timestamped server message.
    pub const SERVER_MSG: u8 = 1;
    /// Opaque byte blob (file transfer).
    pub const BYTES: u8 = 2;
    /// Reserved for chunked file transfer; currently ignored on decode.
    pub const FILE_PART: u8 = 3;
    /// Attachment announcement, client to server.
    pub const FILE_ATTACH_SEND: u8 = 4;
    /// Attachment notice, server to clients.
    pub const FILE_ATTACH_RECV: u8 = 5;

    /// Mask selecting the command range.
    pub const MASK_CMD: u8 = 0x80;
    /// Mask selecting one-argument commands.
    pub const MASK_CMD_ONE_ARG: u8 = 0xA0;
    /// Mask selecting no-argument commands.
    pub const MASK_CMD_NO_ARGS: u8 = 0xC0;

    /// Private message; the only two-argument command.
    pub const TELL: u8 = 0x80;
    /// Remove a member (manager only).
    pub const KICK: u8 = 0xA0;
    /// Grant manager permissions (manager only).
    pub const PROMOTE: u8 = 0xA1;
    /// Revoke manager permissions (manager only).
    pub const DEMOTE: u8 = 0xA2;
    /// Silence a member (manager only).
    pub const MUTE: u8 = 0xA3;
    /// Unsilence a member (manager only).
    pub const UNMUTE: u8 = 0xA4;
    /// Request the command list.
    pub const HELP: u8 = 0xC0;
    /// Leave the chat.
    pub const QUIT: u8 = 0xC1;
    /// Request the manager list.
    pub const VIEW_MANAGERS: u8 = 0xC2;
    /// Request the full member list.
    pub const LIST: u8 = 0xC3;
}

/// Command discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Private message to one member.
    Tell,
    /// Remove a member.
    Kick,
    /// Grant manager permissions.
    Promote,
    /// Revoke manager permissions.
    Demote,
    /// Silence a member.
    Mute,
    /// Unsilence a member.
    Unmute,
    /// Show the command list.
    Help,
    /// Leave the chat.
    Quit,
    /// Show the manager list.
    ViewManagers,
    /// Show all online members.
    List,
    /// Unrecognized command byte, kept verbatim so the dispatcher can
    /// answer with its invalid-input error.
    Unknown(u8),
}

impl CommandKind {
    /// Map a wire byte to a command kind.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            tag::TELL => Self::Tell,
            tag::KICK => Self::Kick,
            tag::PROMOTE => Self::Promote,
            tag::DEMOTE => Self::Demote,
            tag::MUTE => Self::Mute,
            tag::UNMUTE => Self::Unmute,
            tag::HELP => Self::Help,
            tag::QUIT => Self::Quit,
            tag::VIEW_MANAGERS => Self::ViewManagers,
            tag::LIST => Self::List,
            other => Self::Unknown(other),
        }
    }

    /// The wire byte for this command kind.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Tell => tag::TELL,
            Self::Kick => tag::KICK,
            Self::Promote => tag::PROMOTE,
            Self::Demote => tag::DEMOTE,
            Self::Mute => tag::MUTE,
            Self::Unmute => tag::UNMUTE,
            Self::Help => tag::HELP,
            Self::Quit => tag::QUIT,
            Self::ViewManagers => tag::VIEW_MANAGERS,
            Self::List => tag::LIST,
            Self::Unknown(byte) => byte,
        }
    }

    /// True for moderation commands that require manager permissions.
    pub fn requires_manager(self) -> bool {
        matches!(
            self,
            Self::Kick | Self::Promote | Self::Demote | Self::Mute | Self::Unmute
        )
    }
}

/// A chat command with its (possibly empty) arguments.
///
/// Encoding depends on the kind: TELL packs `name` behind a `u16` length
/// prefix with `msg` consuming the remainder, one-argument commands carry
/// `name` as the entire payload, and no-argument commands carry nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Which command.
    pub kind: CommandKind,
    /// Target member name, where the command takes one.
    pub name: String,
    /// Message text (TELL only).
    pub msg: String,
}

impl Command {
    /// A command without arguments.
    pub fn no_args(kind: CommandKind) -> Self {
        Self {
            kind,
            name: String::new(),
            msg: String::new(),
        }
    }

    /// A command targeting one member.
    pub fn one_arg(kind: CommandKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            msg: String::new(),
        }
    }

    /// A private message.
    pub fn tell(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Tell,
            name: name.into(),
            msg: msg.into(),
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let byte = self.kind.to_byte();
        if byte == tag::TELL {
            let name_len = u16::try_from(self.name.len())
                .map_err(|_| Error::Protocol("name too long".into()))?;
            let mut body = Vec::with_capacity(2 + self.name.len() + self.msg.len());
            body.extend_from_slice(&name_len.to_be_bytes());
            body.extend_from_slice(self.name.as_bytes());
            body.extend_from_slice(self.msg.as_bytes());
            Ok(body)
        } else if byte & tag::MASK_CMD_ONE_ARG == tag::MASK_CMD_ONE_ARG {
            Ok(self.name.as_bytes().to_vec())
        } else {
            Ok(Vec::new())
        }
    }

    /// Decode a command body. The exact TELL check runs before the one-arg
    /// mask; everything else carries no arguments.
    fn decode(byte: u8, body: &[u8]) -> Result<Self> {
        let kind = CommandKind::from_byte(byte);
        if byte == tag::TELL {
            if body.len() < 2 {
                return Err(Error::Protocol("tell payload too short".into()));
            }
            let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            if body.len() < 2 + name_len {
                return Err(Error::Protocol("tell name out of range".into()));
            }
            Ok(Self {
                kind,
                name: utf8(&body[2..2 + name_len])?,
                msg: utf8(&body[2 + name_len..])?,
            })
        } else if byte & tag::MASK_CMD_ONE_ARG == tag::MASK_CMD_ONE_ARG {
            Ok(Self {
                kind,
                name: utf8(body)?,
                msg: String::new(),
            })
        } else {
            Ok(Self::no_args(kind))
        }
    }
}

/// A named, timestamped message relayed by the server.
///
/// An empty `name` marks a system message not attributable to any member;
/// clients use the distinction only to pick a rendering category.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMsg {
    /// Seconds since the Unix epoch, as carried on the wire.
    pub timestamp: f32,
    /// Originating member name; empty for system messages.
    pub name: String,
    /// Message text.
    pub msg: String,
}

impl ServerMsg {
    /// A system message stamped with the current time.
    pub fn system(msg: impl Into<String>) -> Self {
        Self {
            timestamp: unix_now(),
            name: String::new(),
            msg: msg.into(),
        }
    }

    /// A member-attributed message stamped with the current time.
    pub fn named(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            timestamp: unix_now(),
            name: name.into(),
            msg: msg.into(),
        }
    }

    /// True when the message is server-originated.
    pub fn is_system(&self) -> bool {
        self.name.is_empty()
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let name_len =
            u16::try_from(self.name.len()).map_err(|_| Error::Protocol("name too long".into()))?;
        let mut body = Vec::with_capacity(6 + self.name.len() + self.msg.len());
        body.extend_from_slice(&self.timestamp.to_be_bytes());
        body.extend_from_slice(&name_len.to_be_bytes());
        body.extend_from_slice(self.name.as_bytes());
        body.extend_from_slice(self.msg.as_bytes());
        Ok(body)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 6 {
            return Err(Error::Protocol("server message too short".into()));
        }
        let timestamp = f32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let name_len = u16::from_be_bytes([body[4], body[5]]) as usize;
        if body.len() < 6 + name_len {
            return Err(Error::Protocol("server message name out of range".into()));
        }
        Ok(Self {
            timestamp,
            name: utf8(&body[6..6 + name_len])?,
            msg: utf8(&body[6 + name_len..])?,
        })
    }
}

/// A random 128-bit attachment identifier minted by the server.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AttachmentId([u8; 16]);

impl AttachmentId {
    /// Mint a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Restore from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentId({})", hex::encode(self.0))
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Attachment notice broadcast by the server when a member uploads a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachRecv {
    /// Filename as announced by the uploader.
    pub filename: String,
    /// Name of the uploading member.
    pub sender: String,
    /// Identifier minted for the stored blob.
    pub id: AttachmentId,
}

impl FileAttachRecv {
    fn encode_body(&self) -> Result<Vec<u8>> {
        let sender_len = u16::try_from(self.sender.len())
            .map_err(|_| Error::Protocol("name too long".into()))?;
        let mut body = Vec::with_capacity(2 + self.sender.len() + 16 + self.filename.len());
        body.extend_from_slice(&sender_len.to_be_bytes());
        body.extend_from_slice(self.sender.as_bytes());
        body.extend_from_slice(self.id.as_bytes());
        body.extend_from_slice(self.filename.as_bytes());
        Ok(body)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(Error::Protocol("attach notice too short".into()));
        }
        let sender_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let id_end = 2 + sender_len + 16;
        if body.len() < id_end {
            return Err(Error::Protocol("attach notice out of range".into()));
        }
        let id_bytes: [u8; 16] = body[2 + sender_len..id_end]
            .try_into()
            .map_err(|_| Error::Protocol("attach notice out of range".into()))?;
        Ok(Self {
            sender: utf8(&body[2..2 + sender_len])?,
            id: AttachmentId::from_bytes(id_bytes),
            filename: utf8(&body[id_end..])?,
        })
    }
}

/// A decoded CPP payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain text message.
    Msg(String),
    /// Server-relayed message.
    Server(ServerMsg),
    /// Opaque byte blob.
    Bytes(Vec<u8>),
    /// Chat command.
    Command(Command),
    /// Attachment announcement (client to server).
    FileAttachSend {
        /// Name of the file about to be uploaded.
        filename: String,
    },
    /// Attachment notice (server to clients).
    FileAttachRecv(FileAttachRecv),
}

impl Payload {
    /// The zero-argument quit command.
    pub fn quit() -> Self {
        Payload::Command(Command::no_args(CommandKind::Quit))
    }

    /// The wire type tag for this payload.
    pub fn tag(&self) -> u8 {
        match self {
            Payload::Msg(_) => tag::MSG,
            Payload::Server(_) => tag::SERVER_MSG,
            Payload::Bytes(_) => tag::BYTES,
            Payload::Command(cmd) => cmd.kind.to_byte(),
            Payload::FileAttachSend { .. } => tag::FILE_ATTACH_SEND,
            Payload::FileAttachRecv(_) => tag::FILE_ATTACH_RECV,
        }
    }

    /// Encode into a complete frame (header plus body).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        encode_frame(self.tag(), &body)
    }

    /// Encode a possibly-absent payload; absence encodes as an implicit
    /// quit (a vanished caller is treated as having left).
    pub fn encode_or_quit(payload: Option<&Payload>) -> Result<Vec<u8>> {
        match payload {
            Some(p) => p.encode(),
            None => Payload::quit().encode(),
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Msg(text) => Ok(text.as_bytes().to_vec()),
            Payload::Server(msg) => msg.encode_body(),
            Payload::Bytes(data) => Ok(data.clone()),
            Payload::Command(cmd) => cmd.encode_body(),
            Payload::FileAttachSend { filename } => Ok(filename.as_bytes().to_vec()),
            Payload::FileAttachRecv(notice) => notice.encode_body(),
        }
    }

    /// Decode a frame body by tag.
    ///
    /// `Ok(None)` means the tag is unrecognized (or reserved) and the frame
    /// should be ignored silently.
    pub fn decode(tag_byte: u8, body: &[u8]) -> Result<Option<Payload>> {
        match tag_byte {
            tag::MSG => Ok(Some(Payload::Msg(utf8(body)?))),
            tag::SERVER_MSG => Ok(Some(Payload::Server(ServerMsg::decode(body)?))),
            tag::BYTES => Ok(Some(Payload::Bytes(body.to_vec()))),
            tag::FILE_ATTACH_SEND => Ok(Some(Payload::FileAttachSend {
                filename: utf8(body)?,
            })),
            tag::FILE_ATTACH_RECV => Ok(Some(Payload::FileAttachRecv(FileAttachRecv::decode(
                body,
            )?))),
            byte if byte & tag::MASK_CMD == tag::MASK_CMD => {
                Ok(Some(Payload::Command(Command::decode(byte, body)?)))
            }
            _ => Ok(None),
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Protocol("invalid utf-8".into()))
}

fn unix_now() -> f32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f32()
}
