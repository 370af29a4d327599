use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::clipboard::ContentKind;
use crate::error::{ClipError, Result};

/// 1 byte kind + 4 bytes big-endian payload length.
pub const HEADER_LEN: usize = 5;

/// Hard cap on a single frame payload (large enough for screenshots).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Idle limit for one complete frame read.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Limit for one complete frame write.
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One clipboard event on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: ContentKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: ContentKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Serializes header and payload into a single buffer so the frame goes
    /// out in one write call.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Parses and validates a frame header. The payload length is checked before
/// any payload byte is read so oversize frames are fatal up front.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(ContentKind, usize)> {
    let kind = ContentKind::from_wire(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ClipError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }
    Ok((kind, len))
}

/// Reads one frame, enforcing the per-frame idle deadline. Timeout or EOF is
/// fatal for the connection; the caller closes it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    timeout(FRAME_READ_TIMEOUT, read_frame_inner(reader))
        .await
        .map_err(|_| ClipError::Protocol("frame read timed out".to_string()))?
}

async fn read_frame_inner<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let (kind, len) = parse_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame { kind, payload })
}

/// Writes one frame under the write deadline.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(FRAME_WRITE_TIMEOUT, writer.write_all(&frame.encode()))
        .await
        .map_err(|_| ClipError::Protocol("frame write timed out".to_string()))?
        .map_err(ClipError::Io)
}
