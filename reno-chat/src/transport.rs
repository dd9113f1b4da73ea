//! Length-prefixed envelope I/O over a byte stream.
//!
//! [`FrameReader`] and [`FrameWriter`] speak [`Envelope`] instead of raw
//! bytes on top of any `AsyncRead` / `AsyncWrite` half, so the engine runs
//! unchanged over a `TcpStream` or an in-memory `tokio::io::duplex` pipe.
//! All protocol logic lives elsewhere; this module owns only byte I/O.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::{self, Envelope, LENGTH_PREFIX};
use crate::error::FrameError;

/// One frame pulled off the stream.
#[derive(Debug)]
pub struct Frame {
    /// Bytes consumed from the stream, prefix included.
    pub wire_len: usize,
    /// Decoded envelope, or the reason the body was unreadable.
    pub envelope: Result<Envelope, FrameError>,
}

/// Reads length-prefixed envelopes.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
            buf: Vec::new(),
        }
    }

    /// Read the next frame.
    ///
    /// A body that fails to decode is returned inside [`Frame::envelope`] so
    /// the caller can count it and keep reading; stream-level failures
    /// (I/O, EOF, oversized length) are fatal and returned as `Err`.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match self.inner.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len,
                limit: self.max_frame_size,
            });
        }

        self.buf.resize(len, 0);
        match self.inner.read_exact(&mut self.buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
            Err(e) => return Err(e.into()),
        }
        Ok(Frame {
            wire_len: LENGTH_PREFIX + len,
            envelope: envelope::decode(&self.buf),
        })
    }
}

/// Writes length-prefixed envelopes.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one already-encoded frame (prefix included) and flush it.
    pub async fn write_raw(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and write `envelope`; returns the bytes written.
    pub async fn write_frame(&mut self, envelope: &Envelope) -> Result<usize, FrameError> {
        let frame = envelope::encode(envelope)?;
        self.write_raw(&frame).await?;
        Ok(frame.len())
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
