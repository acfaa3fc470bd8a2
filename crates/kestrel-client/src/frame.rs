//! Length-prefixed framing over a byte stream.
//!
//! Each frame is a 4-byte big-endian payload length followed by the payload.
//! The payload is one encoded protobuf message; this layer never looks inside
//! it, so the same reader and writer serve both ends of a connection.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Default upper bound on an incoming frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Reads whole frames from an [`AsyncRead`].
pub struct FrameReader<R> {
    inner: R,
    max_len: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: R, max_len: u32) -> Self {
        Self { inner, max_len }
    }

    /// Read the next frame's payload.
    ///
    /// End of stream on a frame boundary is [`Error::Closed`]; end of stream
    /// anywhere else is an I/O error.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        let n = self.inner.read(&mut header).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        self.inner.read_exact(&mut header[n..]).await?;

        let len = u32::from_be_bytes(header);
        if len > self.max_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Read and decode the next frame.
    pub async fn read_message<M: Message + Default>(&mut self) -> Result<M> {
        let payload = self.read_frame().await?;
        Ok(M::decode(payload.as_slice())?)
    }
}

/// Writes whole frames to an [`AsyncWrite`].
///
/// Callers that share a writer must serialize access themselves; a frame is
/// only atomic with respect to other frames written through the same
/// `&mut FrameWriter`.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
            len: u32::MAX,
            max: u32::MAX,
        })?;

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_message<M: Message>(&mut self, msg: &M) -> Result<()> {
        self.write_frame(&msg.encode_to_vec()).await
    }

    /// Shut down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
