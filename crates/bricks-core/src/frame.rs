//! Wire framing for messages.
//!
//! Format: 4-byte length (u32 LE) + rkyv-encoded [`Frame`] body.
//! Bodies are validated on decode, so a corrupt or hostile stream yields
//! an error instead of undefined behaviour.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::message::Message;

/// Current frame layout version.
pub const FRAME_VERSION: u8 = 1;

/// Largest accepted frame body (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// One message as laid out on the wire.
#[derive(Debug, Archive, Serialize, Deserialize)]
struct Frame {
    version: u8,
    command: String,
    payload: Option<Vec<u8>>,
}

/// Write one message as a length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = Frame {
        version: FRAME_VERSION,
        command: message.command().to_string(),
        payload: message.payload().map(<[u8]>::to_vec),
    };
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&frame)
        .map_err(|e| Error::Serialization(format!("Failed to encode frame: {}", e)))?;

    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "frame too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns [`Error::ConnectionClosed`] if the stream ends cleanly on a
/// frame boundary. Not cancel-safe: dropping the future mid-frame loses
/// the bytes read so far. Use a [`FrameReader`] where reads may be
/// interrupted.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    FrameReader::new().read(reader).await
}

/// Incremental frame decoder.
///
/// Progress through the length prefix and body is kept in the reader
/// itself, so [`FrameReader::read`] is cancel-safe: if its future is
/// dropped part way through a frame, the next call resumes where the
/// last one stopped.
pub struct FrameReader {
    len_bytes: [u8; 4],
    len_filled: usize,
    /// Body length, once the prefix is complete.
    body_len: Option<usize>,
    body: AlignedVec,
    body_filled: usize,
}

impl FrameReader {
    /// A reader positioned on a frame boundary.
    pub fn new() -> Self {
        Self {
            len_bytes: [0; 4],
            len_filled: 0,
            body_len: None,
            body: AlignedVec::new(),
            body_filled: 0,
        }
    }

    /// Whether part of a frame has been consumed but not yet returned.
    pub fn is_mid_frame(&self) -> bool {
        self.len_filled > 0
    }

    /// Read the next frame from `reader`.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] on a clean end of stream between
    /// frames, [`Error::Io`] if the stream ends inside a frame, and
    /// [`Error::InvalidFrame`] for oversized, undecodable or
    /// wrong-version frames.
    pub async fn read<R>(&mut self, reader: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let len = match self.body_len {
            Some(len) => len,
            None => self.read_prefix(reader).await?,
        };

        while self.body_filled < len {
            let n = reader.read(&mut self.body[self.body_filled..len]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame body",
                )));
            }
            self.body_filled += n;
        }

        let decoded = decode(&self.body[..len]);
        self.reset();
        decoded
    }

    async fn read_prefix<R>(&mut self, reader: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        while self.len_filled < self.len_bytes.len() {
            let n = reader.read(&mut self.len_bytes[self.len_filled..]).await?;
            if n == 0 {
                if self.len_filled == 0 {
                    return Err(Error::ConnectionClosed);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame length prefix",
                )));
            }
            self.len_filled += n;
        }

        let len = u32::from_le_bytes(self.len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            self.reset();
            return Err(Error::InvalidFrame(format!("frame too large: {} bytes", len)));
        }

        self.body.clear();
        self.body.resize(len, 0);
        self.body_filled = 0;
        self.body_len = Some(len);
        Ok(len)
    }

    fn reset(&mut self) {
        self.len_filled = 0;
        self.body_len = None;
        self.body_filled = 0;
        if self.body.capacity() > READ_BUFFER_KEEP {
            self.body = AlignedVec::new();
        } else {
            self.body.clear();
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("len_filled", &self.len_filled)
            .field("body_len", &self.body_len)
            .field("body_filled", &self.body_filled)
            .finish()
    }
}

/// Body buffers up to this size are reused between frames.
const READ_BUFFER_KEEP: usize = 64 * 1024;

fn decode(body: &[u8]) -> Result<Message> {
    let frame = rkyv::from_bytes::<Frame, rkyv::rancor::Error>(body)
        .map_err(|e| Error::InvalidFrame(format!("Failed to decode frame: {}", e)))?;

    if frame.version != FRAME_VERSION {
        return Err(Error::InvalidFrame(format!(
            "unsupported frame version {} (expected {})",
            frame.version, FRAME_VERSION
        )));
    }

    match frame.payload {
        Some(payload) => Message::with_payload(frame.command, payload),
        None => Message::new(frame.command),
    }
    .map_err(|_| Error::InvalidFrame("frame carries an empty command".to_string()))
}
