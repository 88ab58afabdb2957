//! Length-prefixed framing over a byte stream.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Works over any `AsyncRead + AsyncWrite` stream: TCP sockets in production,
//! `tokio::io::duplex` pipes in tests.

use super::{Connection, FrameSink, FrameSource};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(RpcError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len, max_size
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| RpcError::protocol("frame larger than 4GiB"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub struct FramedSink<W> {
    writer: W,
}

pub struct FramedSource<R> {
    reader: R,
    max_size: usize,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for FramedSink<W> {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        write_frame(&mut self.writer, &frame).await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FramedSource<R> {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.reader, self.max_size).await
    }
}

/// Wrap a byte stream as a framed [`Connection`].
pub fn connection<S>(stream: S, max_size: usize) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    Connection::new(
        Box::new(FramedSink { writer }),
        Box::new(FramedSource { reader, max_size }),
    )
}
