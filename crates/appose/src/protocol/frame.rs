//! Length-prefixed framing over a byte stream
//!
//! Format: `[length: 4 bytes BE][body: length bytes]`. The body is one JSON
//! document; the prefix makes any byte (newlines included) safe inside it.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::ProtocolError;

/// Default upper bound on a single frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Writer half of a framed connection
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame and flush it
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            len: body.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(body);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Serialize `message` as JSON and send it as one frame
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(message)?;
        trace!("-> {}", String::from_utf8_lossy(&body));
        self.write_frame(&body).await
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reader half of a framed connection
pub struct FrameReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        Self { inner, max_len }
    }

    /// Read one frame body.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.inner.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated);
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if len > self.max_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        let mut body = vec![0u8; len];
        match self.inner.read_exact(&mut body).await {
            Ok(_) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one frame and parse it as JSON
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.read_frame().await? {
            Some(body) => {
                trace!("<- {}", String::from_utf8_lossy(&body));
                Ok(Some(serde_json::from_slice(&body)?))
            }
            None => Ok(None),
        }
    }
}
