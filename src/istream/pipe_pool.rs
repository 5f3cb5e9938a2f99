//! Shared pool of adapter pipes (`fb_pool` in the original).
//!
//! When a producer can only offer a file or socket fd directly but the
//! consumer can only accept a pipe (or vice versa), an adapter istream
//! splices through a pipe leased from this pool. Acquisition is always
//! non-blocking: if the pool is at capacity the adapter falls back to
//! copying bytes through a regular buffer instead of failing the request.
//!
//! Real `splice(2)` plumbing is outside the core (the HTTP/1.1 server and
//! the concrete upstream clients that would drive it are out of scope);
//! this module models the pool's admission and accounting behaviour, which
//! is what the back-pressure invariants it supports actually depend on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct PipePool {
    capacity: usize,
    in_use: AtomicUsize,
}

/// A leased pipe slot; returns itself to the pool on drop.
pub struct PipeLease {
    pool: Arc<PipePool>,
}

impl Drop for PipeLease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PipePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(PipePool {
            capacity,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Attempts to lease a pipe slot without blocking. Returns `None` if the
    /// pool is exhausted, in which case the caller should fall back to
    /// data-copy mode rather than treat this as an error.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PipeLease> {
        loop {
            let current = self.in_use.load(Ordering::Acquire);
            if current >= self.capacity {
                return None;
            }
            if self
                .in_use
                .compare_exchange(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(PipeLease { pool: self.clone() });
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_pool_falls_back_instead_of_blocking() {
        let pool = PipePool::new(1);
        let first = pool.try_acquire();
        assert!(first.is_some());
        assert!(pool.try_acquire().is_none(), "second lease should fail fast");
        drop(first);
        assert!(pool.try_acquire().is_some(), "slot is reusable after release");
    }

    #[test]
    fn in_use_tracks_outstanding_leases() {
        let pool = PipePool::new(4);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(a);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.in_use(), 0);
    }
}
