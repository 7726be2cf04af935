//! Length-prefixed framing over a byte stream.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of a
//! bincode-encoded [`ProtocolMessage`].

use crate::error::{NetError, Result};
use crate::protocol::ProtocolMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

pub struct FrameWriter<W> {
    inner: W,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    pub async fn send(&mut self, msg: &ProtocolMessage) -> Result<()> {
        let data = msg.encode()?;
        if data.len() > self.max_frame_len {
            return Err(NetError::MalformedMessage(format!(
                "{} of {} bytes exceeds frame limit {}",
                msg.kind(),
                data.len(),
                self.max_frame_len
            )));
        }
        self.inner.write_u32(data.len() as u32).await?;
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reassembles frames from a stream.
///
/// [`FrameReader::next_frame`] is cancel-safe: bytes read before a
/// cancellation stay buffered for the next call.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            max_frame_len,
        }
    }

    /// Next complete frame body, or `None` if the peer closed cleanly between
    /// frames.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(NetError::ConnectionLost(format!(
                    "peer closed with {} bytes of a partial frame",
                    self.buf.len()
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_len {
            return Err(NetError::ConnectionLost(format!(
                "frame of {} bytes exceeds limit {}",
                len, self.max_frame_len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }
}
