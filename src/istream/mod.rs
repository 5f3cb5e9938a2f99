//! Pull-based byte-stream abstraction.
//!
//! An [`Istream`] is read by its consumer, not pushed at it: the consumer
//! calls [`Istream::read`] and gets back one chunk, EOF, or an error. This is
//! the same shape the original `istream` handler interface uses
//! (`on_data`/`on_direct`/`on_eof`/`on_error`), flattened into a single
//! `async fn` because Rust's `async`/`await` already gives us the
//! suspend-and-resume behaviour the original needed a manual state machine
//! for. `available()` and `skip()` keep the same meaning as the original:
//! "how much could I hand you right now without blocking" and "drop the next
//! `n` bytes without materialising them".
//!
//! Direct-fd transfer (`splice()` between sockets/pipes/files) is modelled
//! by [`DirectCaps`]: a stream advertises which fd kinds it can hand to a
//! consumer directly, and a consumer advertises which kinds it can accept.
//! When the two don't overlap but both could use a pipe, [`pipe_pool`]
//! supplies an adapter's pipe on demand.

pub mod pipe_pool;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProxyError;

/// fd kinds across which a direct (zero-copy) transfer is possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectCaps {
    pub file: bool,
    pub pipe: bool,
    pub socket: bool,
    pub chardev: bool,
}

impl DirectCaps {
    pub const NONE: DirectCaps = DirectCaps {
        file: false,
        pipe: false,
        socket: false,
        chardev: false,
    };

    pub fn intersects(self, other: DirectCaps) -> bool {
        (self.file && other.file)
            || (self.pipe && other.pipe)
            || (self.socket && other.socket)
            || (self.chardev && other.chardev)
    }
}

/// The outcome of one [`Istream::read`] call.
pub enum IstreamEvent {
    /// A chunk of body data. The consumer decides how much of it it
    /// actually consumed; anything not taken must be re-offered on the next
    /// `read()`.
    Data(Bytes),
    /// No more data will ever arrive.
    Eof,
    /// The stream failed; no further reads are valid.
    Error(ProxyError),
}

#[async_trait]
pub trait Istream: Send {
    /// Bytes immediately available without blocking, if known.
    /// `partial: true` allows returning a lower bound (e.g. "at least this
    /// much is buffered") rather than the exact remaining length.
    fn available(&self, partial: bool) -> Option<usize> {
        let _ = partial;
        None
    }

    /// Pulls the next chunk. Re-entrant: calling `read()` again after a
    /// `Data` event is always valid and continues where the last chunk left
    /// off.
    async fn read(&mut self) -> IstreamEvent;

    /// Discards the next `n` bytes without returning them to the consumer;
    /// returns how many were actually skipped (may be less than `n` at EOF).
    async fn skip(&mut self, n: usize) -> usize {
        let mut skipped = 0;
        while skipped < n {
            match self.read().await {
                IstreamEvent::Data(chunk) => {
                    let take = chunk.len().min(n - skipped);
                    skipped += take;
                }
                IstreamEvent::Eof | IstreamEvent::Error(_) => break,
            }
        }
        skipped
    }

    /// Which direct-fd kinds this stream can hand to a consumer.
    fn direct_caps(&self) -> DirectCaps {
        DirectCaps::NONE
    }

    /// Tears the stream down before EOF (cancellation). Default no-op is
    /// correct for streams with no external resource to release.
    async fn close(&mut self) {}
}

/// An in-memory istream over a single `Bytes` buffer. The simplest possible
/// producer; used for synthetic responses, cached bodies, and test fixtures.
pub struct ByteIstream {
    remaining: Option<Bytes>,
}

impl ByteIstream {
    pub fn new(data: Bytes) -> Self {
        ByteIstream {
            remaining: Some(data),
        }
    }

    pub fn empty() -> Self {
        ByteIstream { remaining: None }
    }
}

#[async_trait]
impl Istream for ByteIstream {
    fn available(&self, _partial: bool) -> Option<usize> {
        Some(self.remaining.as_ref().map_or(0, |b| b.len()))
    }

    async fn read(&mut self) -> IstreamEvent {
        match self.remaining.take() {
            Some(data) if !data.is_empty() => IstreamEvent::Data(data),
            _ => IstreamEvent::Eof,
        }
    }
}

/// Reads an entire istream to completion, concatenating every chunk. Used
/// where the pipeline needs a fully materialised body (e.g. handing a
/// response to the filter cache once it decides to store it).
pub async fn collect_to_bytes(stream: &mut dyn Istream, limit: usize) -> ProxyResultBytes {
    let mut buf = Vec::new();
    loop {
        match stream.read().await {
            IstreamEvent::Data(chunk) => {
                if buf.len() + chunk.len() > limit {
                    return ProxyResultBytes::TooLarge;
                }
                buf.extend_from_slice(&chunk);
            }
            IstreamEvent::Eof => return ProxyResultBytes::Ok(Bytes::from(buf)),
            IstreamEvent::Error(e) => return ProxyResultBytes::Err(e),
        }
    }
}

/// Result of [`collect_to_bytes`]; distinguishes "too large to buffer" from
/// a hard error so callers can fall back to streaming-without-caching.
pub enum ProxyResultBytes {
    Ok(Bytes),
    TooLarge,
    Err(ProxyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn byte_istream_yields_then_eof() {
        let mut s = ByteIstream::new(Bytes::from_static(b"hello"));
        match s.read().await {
            IstreamEvent::Data(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected data"),
        }
        assert!(matches!(s.read().await, IstreamEvent::Eof));
    }

    #[tokio::test]
    async fn collect_respects_size_limit() {
        let mut s = ByteIstream::new(Bytes::from_static(b"0123456789"));
        match collect_to_bytes(&mut s, 4).await {
            ProxyResultBytes::TooLarge => {}
            _ => panic!("expected too-large"),
        }
    }

    #[tokio::test]
    async fn collect_concatenates_full_body() {
        let mut s = ByteIstream::new(Bytes::from_static(b"0123456789"));
        match collect_to_bytes(&mut s, 64).await {
            ProxyResultBytes::Ok(b) => assert_eq!(&b[..], b"0123456789"),
            _ => panic!("expected ok"),
        }
    }
}
