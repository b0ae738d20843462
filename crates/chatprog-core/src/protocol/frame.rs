//! CPP frame layout and stream readers.
//!
//! Handles the `[type][length][payload]` envelope over a byte stream.
//! Malformed headers poison the stream and the connection is dropped;
//! a stream that closes mid-frame reads as a vanished peer, not an error.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::MAX_PAYLOAD_SIZE;

/// Header size: type (1) + length (4) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload type tag.
    pub tag: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(tag: u8, length: u32) -> Self {
        Self { tag, length }
    }

    /// Serialize the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.tag;
        bytes[1..HEADER_SIZE].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parse a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Protocol("header too short".into()));
        }
        let tag = bytes[0];
        let length = u32::from_be_bytes(
            bytes[1..HEADER_SIZE]
                .try_into()
                .map_err(|_| Error::Protocol("invalid length field".into()))?,
        );
        if length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol("payload too large".into()));
        }
        Ok(Self { tag, length })
    }
}

/// Assemble a complete frame from a tag and payload body.
pub fn encode_frame(tag: u8, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Protocol("payload too large".into()));
    }
    let header = FrameHeader::new(tag, body.len() as u32);
    let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

/// Read one complete frame from an async stream.
///
/// Returns `Ok(None)` when the peer closed the stream, whether at a frame
/// boundary or mid-frame. Partial reads are retried until the declared
/// length is satisfied.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    if read_exact_or_eof(reader, &mut header_bytes).await?.is_none() {
        return Ok(None);
    }
    let header = FrameHeader::from_bytes(&header_bytes)?;
    let mut body = vec![0u8; header.length as usize];
    if read_exact_or_eof(reader, &mut body).await?.is_none() {
        return Ok(None);
    }
    Ok(Some((header.tag, body)))
}

/// Fill `buf` completely, mapping a closed or reset stream to `None`.
pub(crate) async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<Option<()>>
where
    R: AsyncRead + Unpin,
{
    use std::io::ErrorKind;
    match reader.read_exact(buf).await {
        Ok(_) => Ok(Some(())),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ) =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Incremental frame reader for non-blocking streams.
///
/// Accumulates bytes and extracts complete frames; the server's control
/// loop feeds it from `try_read` and takes at most one frame per tick.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create a new frame reader.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Add received bytes to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract one complete frame.
    ///
    /// Returns `Ok(Some((tag, body)))` if a complete frame is available and
    /// `Ok(None)` if more bytes are needed. A malformed header clears the
    /// buffer and errors; the caller should drop the connection.
    pub fn try_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = match FrameHeader::from_bytes(&self.buffer) {
            Ok(h) => h,
            Err(e) => {
                self.buffer.clear();
                return Err(e);
            }
        };
        let total = HEADER_SIZE + header.length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        Ok(Some((header.tag, frame[HEADER_SIZE..].to_vec())))
    }

    /// Current buffered byte count.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
