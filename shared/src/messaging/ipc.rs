//! Newline-delimited JSON framing over any async byte stream
//!
//! One frame is one line holding one JSON object. The channel only frames
//! and delivers; what a frame means is up to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};

use super::{IpcError, IpcResult};

/// Frames larger than this are rejected and skipped
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Reading half of an IPC channel
pub struct IpcReader<R> {
    inner: BufReader<R>,
    max_frame_len: usize,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(reader: R, max_frame_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_len,
            line: Vec::new(),
        }
    }

    /// Read the next non-empty frame as raw text, without its newline
    pub async fn recv_frame(&mut self) -> IpcResult<String> {
        loop {
            self.line.clear();
            let limit = self.max_frame_len as u64 + 1;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await?;

            if read == 0 {
                return Err(IpcError::PeerClosed);
            }

            if !self.line.ends_with(b"\n") && self.line.len() > self.max_frame_len {
                let size = self.line.len();
                self.discard_rest_of_line().await?;
                return Err(IpcError::TooLarge {
                    size,
                    max_size: self.max_frame_len,
                });
            }

            let frame = std::str::from_utf8(&self.line).map_err(IpcError::InvalidUtf8)?.trim();
            if !frame.is_empty() {
                return Ok(frame.to_string());
            }
        }
    }

    /// Read and decode the next frame. A frame that fails to decode is
    /// consumed; the channel stays usable.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> IpcResult<T> {
        let frame = self.recv_frame().await?;
        serde_json::from_str(&frame).map_err(|source| IpcError::Decode { frame, source })
    }

    async fn discard_rest_of_line(&mut self) -> IpcResult<()> {
        loop {
            let buf = self.inner.fill_buf().await?;
            if buf.is_empty() {
                return Err(IpcError::PeerClosed);
            }
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                self.inner.consume(pos + 1);
                return Ok(());
            }
            let len = buf.len();
            self.inner.consume(len);
        }
    }
}

/// Writing half of an IPC channel
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> IpcResult<()> {
        let mut frame = serde_json::to_vec(message).map_err(IpcError::Encode)?;
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> IpcResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Both halves of a connection
pub struct IpcChannel<S> {
    pub reader: IpcReader<ReadHalf<S>>,
    pub writer: IpcWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> IpcChannel<S> {
    pub fn new(stream: S) -> Self {
        let (read, write) = split(stream);
        Self {
            reader: IpcReader::new(read),
            writer: IpcWriter::new(write),
        }
    }

    pub fn into_split(self) -> (IpcReader<ReadHalf<S>>, IpcWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}
