//! Non-blocking socket wrapper with read/write buffering.
//!
//! `BufferedSocket` owns one half-duplex-or-full-duplex connection (a TCP
//! stream to an upstream AJP/FastCGI/WAS worker, or to the translation
//! server) and mediates all I/O through an internal read buffer and an
//! internal write queue, so protocol clients built on top of it never see
//! partial reads directly — they see "data available" and "more buffered
//! data may follow" events.
//!
//! The original is built around a manual non-blocking epoll loop; this
//! crate's event loop is `tokio`, so the same read/write-then-handle shape
//! is expressed as `async fn`s instead of callbacks, but the *outcomes* the
//! caller distinguishes are unchanged: a read can be fully consumed,
//! partially consumed (retry), merely "need more bytes", or blocked; a write
//! can complete, partially complete, or block.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ProxyError;

/// Outcome of handing buffered bytes to a consumer.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// All available bytes were fully consumed.
    Ok,
    /// Some bytes were consumed; the rest remain buffered for next time.
    Partial,
    /// The consumer needs more bytes than are currently buffered before it
    /// can make progress (e.g. a framed packet whose length prefix has not
    /// fully arrived yet).
    More,
    /// The consumer is backed up and cannot accept any more right now.
    Blocking,
    /// The peer closed the connection.
    Closed,
}

/// Outcome of a write attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `n` bytes were written.
    Wrote(usize),
    /// The socket would block; caller should retry once writable.
    Blocking,
    /// The socket has been torn down.
    Destroyed,
}

pub struct BufferedSocket<S> {
    io: S,
    read_buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
    /// Disowned on `abandon()`: the fd is handed back to a lease without
    /// being closed.
    abandoned: bool,
}

const DEFAULT_READ_CHUNK: usize = 16 * 1024;

impl<S> BufferedSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        BufferedSocket {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_READ_CHUNK),
            read_timeout,
            write_timeout,
            abandoned: false,
        }
    }

    /// Fills the read buffer with at least one more chunk from the socket.
    /// Returns `Ok(false)` on a clean EOF.
    pub async fn fill(&mut self) -> Result<bool, ProxyError> {
        let mut chunk = [0u8; DEFAULT_READ_CHUNK];
        let n = timeout(self.read_timeout, self.io.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::UpstreamIo(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
            .map_err(ProxyError::UpstreamIo)?;
        if n == 0 {
            return Ok(false);
        }
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    /// Current read buffer contents, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.read_buf
    }

    /// Drops `n` bytes from the front of the read buffer — the consumer's
    /// acknowledgement of how much it used.
    pub fn consume(&mut self, n: usize) {
        self.read_buf.advance(n.min(self.read_buf.len()));
    }

    pub fn buffered_len(&self) -> usize {
        self.read_buf.len()
    }

    /// Writes `data`, respecting the write timeout. Matches the original's
    /// "returns bytes written, or blocking" contract; callers that get a
    /// short write must re-offer the remainder.
    pub async fn write(&mut self, data: &[u8]) -> WriteOutcome {
        if self.abandoned {
            return WriteOutcome::Destroyed;
        }
        match timeout(self.write_timeout, self.io.write(data)).await {
            Ok(Ok(n)) => WriteOutcome::Wrote(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => WriteOutcome::Blocking,
            Ok(Err(_)) => WriteOutcome::Destroyed,
            Err(_) => WriteOutcome::Blocking,
        }
    }

    /// Writes `data` in full, looping over short writes.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), ProxyError> {
        while !data.is_empty() {
            match self.write(data).await {
                WriteOutcome::Wrote(0) => {
                    return Err(ProxyError::UpstreamIo(std::io::Error::from(
                        std::io::ErrorKind::WriteZero,
                    )))
                }
                WriteOutcome::Wrote(n) => data = &data[n..],
                WriteOutcome::Blocking => continue,
                WriteOutcome::Destroyed => {
                    return Err(ProxyError::UpstreamIo(std::io::Error::from(
                        std::io::ErrorKind::BrokenPipe,
                    )))
                }
            }
        }
        Ok(())
    }

    /// Disowns the underlying fd without closing it, so a `Lease` can
    /// return the connection to its stock without the socket's own drop
    /// tearing it down.
    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn fill_then_consume_round_trip() {
        let (mut client, server) = duplex(64);
        client.write_all(b"hello").await.unwrap();
        let mut sock = BufferedSocket::new(server, Duration::from_secs(1), Duration::from_secs(1));
        assert!(sock.fill().await.unwrap());
        assert_eq!(sock.peek(), b"hello");
        sock.consume(5);
        assert_eq!(sock.buffered_len(), 0);
    }

    #[tokio::test]
    async fn write_all_handles_short_writes() {
        let (mut client, server) = duplex(4);
        let mut sock = BufferedSocket::new(server, Duration::from_secs(1), Duration::from_secs(1));
        let writer = tokio::spawn(async move {
            sock.write_all(b"0123456789").await.unwrap();
        });
        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        while received.len() < 10 {
            let n = client.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap();
        assert_eq!(received, b"0123456789");
    }

    #[tokio::test]
    async fn abandon_prevents_further_writes() {
        let (_client, server) = duplex(64);
        let mut sock = BufferedSocket::new(server, Duration::from_secs(1), Duration::from_secs(1));
        sock.abandon();
        assert_eq!(sock.write(b"x").await, WriteOutcome::Destroyed);
    }
}
