//! Queued socket primitives used by server connections and clients.
//!
//! Every call is bounded by the socket's read or write timeout; a timeout
//! surfaces as [`ErrorKind::Timeout`]. Reads are cancel-safe, so a pending
//! `read_queued` can race other futures in `tokio::select!`.

use crate::{errors::ErrorKind, limits::ConnLimits};
use std::{io::SeekFrom, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    time::{sleep, timeout},
};

/// Anything a [`Socket`] can run over: TCP streams, TLS wrappers, or
/// in-memory duplex pipes in tests.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

/// A byte stream with timeouts and a push-back buffer.
pub struct Socket {
    stream: Box<dyn Stream>,
    scratch: Vec<u8>,
    /// Bytes handed back with [`unread`](Self::unread), served first.
    pending: Vec<u8>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("pending", &self.pending.len())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Wraps `stream`; `net_buffer` bounds a single read.
    pub fn new<S: Stream>(stream: S, limits: &ConnLimits, net_buffer: usize) -> Self {
        Self {
            stream: Box::new(stream),
            scratch: vec![0; net_buffer.max(1)],
            pending: Vec::new(),
            read_timeout: limits.socket_read_timeout,
            write_timeout: limits.socket_write_timeout,
        }
    }

    #[inline]
    pub fn set_read_timeout(&mut self, time: Duration) {
        self.read_timeout = time;
    }

    /// Appends at most one read worth of bytes (never more than
    /// `max_size`) to `buffer`. `Ok(0)` means the peer closed the stream.
    pub async fn read_queued(&mut self, buffer: &mut Vec<u8>, max_size: usize) -> Result<usize, ErrorKind> {
        let max_size = max_size.min(self.scratch.len());

        if !self.pending.is_empty() {
            let count = self.pending.len().min(max_size);
            buffer.extend(self.pending.drain(..count));
            return Ok(count);
        }

        let count = tokio::select! {
            biased;

            result = self.stream.read(&mut self.scratch[..max_size]) => result?,
            _ = sleep(self.read_timeout) => return Err(ErrorKind::Timeout),
        };

        buffer.extend_from_slice(&self.scratch[..count]);
        Ok(count)
    }

    /// Pushes bytes back so the next read returns them first.
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.pending.splice(0..0, data.iter().copied());
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Writes all of `data`.
    pub async fn write_queued(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        timeout(self.write_timeout, self.stream.write_all(data)).await??;
        Ok(())
    }

    /// Streams `length` bytes of `file` starting at `offset`, one
    /// `chunk_size` block per write. Returns the bytes sent, which is
    /// less than `length` only when the file is shorter.
    pub async fn write_file_queued(
        &mut self,
        file: &mut File,
        offset: u64,
        length: u64,
        chunk_size: usize,
    ) -> Result<u64, ErrorKind> {
        file.seek(SeekFrom::Start(offset)).await?;

        let mut chunk = vec![0; chunk_size.max(1)];
        let mut sent = 0;
        while sent < length {
            let want = (length - sent).min(chunk.len() as u64) as usize;
            let count = file.read(&mut chunk[..want]).await?;
            if count == 0 {
                break;
            }

            self.write_queued(&chunk[..count]).await?;
            sent += count as u64;
        }

        Ok(sent)
    }

    pub async fn flush(&mut self) -> Result<(), ErrorKind> {
        timeout(self.write_timeout, self.stream.flush()).await??;
        Ok(())
    }

    /// Flushes and closes the write half; errors are irrelevant here.
    pub async fn shutdown(&mut self) {
        let _ = timeout(self.write_timeout, self.stream.shutdown()).await;
    }
}
