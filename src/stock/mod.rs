//! Keyed pool of reusable items ("stock" in the original): upstream
//! connections, child processes, pipes.
//!
//! A [`Stock<T>`] is generic over the item type and the [`StockClass<T>`]
//! that knows how to create/probe/destroy one. Unlike the original's manual
//! callback-based `stock_get`, `Get` here is just `async fn get(...)`
//! because `tokio` gives us suspension for free; the *policy* — per-key
//! `limit`/`max_idle`, FIFO queuing past the limit, idle-timeout eviction,
//! and the borrow-time health probe that catches a peer that silently
//! closed an idle connection — is unchanged.
//!
//! [`MultiStock`] builds capacity-sharing leases on top of the same idle/busy
//! bookkeeping: many concurrent borrowers can share one item (a WAS/LHTTP
//! worker that accepts N concurrent requests) until its `max_leases` is hit.

pub mod multi;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::ProxyError;

/// Knows how to create, health-probe, and tear down items for one stock.
#[async_trait]
pub trait StockClass<T: Send + 'static>: Send + Sync {
    /// Creates a fresh item for `key`. May be slow (spawn a process, dial a
    /// socket); errors propagate straight to the waiting caller.
    async fn create(&self, key: &str) -> Result<T, ProxyError>;

    /// Non-blocking health probe run just before an idle item is handed
    /// back out, or while it sits idle and becomes readable/erroring
    /// unexpectedly. Returning `false` destroys the item instead of
    /// reusing it.
    fn borrow(&self, item: &mut T) -> bool {
        let _ = item;
        true
    }

    /// Called when an item is released back to idle (not destroyed).
    fn release(&self, item: &mut T) {
        let _ = item;
    }

    /// Called exactly once when an item is finally torn down.
    fn destroy(&self, item: T) {
        drop(item);
    }
}

struct IdleEntry<T> {
    item: T,
    since: Instant,
}

struct KeyState<T> {
    idle: Vec<IdleEntry<T>>,
    busy: usize,
    fading: bool,
}

impl<T> KeyState<T> {
    fn new() -> Self {
        KeyState {
            idle: Vec::new(),
            busy: 0,
            fading: false,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.busy
    }
}

pub struct StockStats {
    pub busy: usize,
    pub idle: usize,
}

pub struct Stock<T: Send + 'static> {
    class: Arc<dyn StockClass<T>>,
    limit: usize,
    max_idle: usize,
    idle_timeout: Duration,
    keys: Mutex<HashMap<String, KeyState<T>>>,
    notify: Notify,
}

impl<T: Send + 'static> Stock<T> {
    pub fn new(class: Arc<dyn StockClass<T>>, limit: usize, max_idle: usize) -> Arc<Self> {
        Self::with_idle_timeout(class, limit, max_idle, Duration::from_secs(300))
    }

    pub fn with_idle_timeout(
        class: Arc<dyn StockClass<T>>,
        limit: usize,
        max_idle: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Stock {
            class,
            limit,
            max_idle,
            idle_timeout,
            keys: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Borrows (or creates) an item for `key`. Blocks (asynchronously) if
    /// the per-key limit is already reached, until a slot frees up.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<Lease<T>, ProxyError> {
        loop {
            {
                let mut keys = self.keys.lock().await;
                let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);

                // Drain expired or unhealthy idle items first.
                while let Some(mut entry) = state.idle.pop() {
                    let expired = entry.since.elapsed() >= self.idle_timeout;
                    if expired || !self.class.borrow(&mut entry.item) {
                        self.class.destroy(entry.item);
                        continue;
                    }
                    state.busy += 1;
                    return Ok(Lease::new(self.clone(), key.to_string(), entry.item));
                }

                if state.total() < self.limit {
                    state.busy += 1;
                } else {
                    drop(keys);
                    self.notify.notified().await;
                    continue;
                }
            }

            // Created outside the lock: creation may be slow.
            match self.class.create(key).await {
                Ok(item) => return Ok(Lease::new(self.clone(), key.to_string(), item)),
                Err(e) => {
                    let mut keys = self.keys.lock().await;
                    if let Some(state) = keys.get_mut(key) {
                        state.busy -= 1;
                    }
                    self.notify.notify_waiters();
                    return Err(e);
                }
            }
        }
    }

    /// Synchronous variant for stock classes whose `create` never actually
    /// suspends (e.g. it only does local bookkeeping). Fails rather than
    /// waiting if the limit is currently exhausted.
    pub fn get_now(self: &Arc<Self>, key: &str) -> Option<Lease<T>>
    where
        T: Clone,
    {
        let mut keys = self.keys.try_lock().ok()?;
        let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);
        let entry = state.idle.pop()?;
        state.busy += 1;
        Some(Lease::new(self.clone(), key.to_string(), entry.item))
    }

    async fn put(&self, key: &str, mut item: T, destroy: bool) {
        let mut keys = self.keys.lock().await;
        let Some(state) = keys.get_mut(key) else {
            self.class.destroy(item);
            return;
        };
        state.busy = state.busy.saturating_sub(1);

        if destroy || state.fading || state.idle.len() >= self.max_idle {
            self.class.destroy(item);
        } else {
            self.class.release(&mut item);
            state.idle.push(IdleEntry {
                item,
                since: Instant::now(),
            });
        }

        if state.total() == 0 {
            keys.remove(key);
        }
        drop(keys);
        self.notify.notify_waiters();
    }

    /// Marks every currently-idle item for destruction and forces future
    /// `get()` calls to create fresh items, used on configuration reload.
    pub async fn fade_all(&self) {
        let mut keys = self.keys.lock().await;
        for state in keys.values_mut() {
            state.fading = true;
            let idle = std::mem::take(&mut state.idle);
            for entry in idle {
                self.class.destroy(entry.item);
            }
        }
        keys.retain(|_, state| state.total() > 0);
        self.notify.notify_waiters();
    }

    pub async fn stats(&self, key: &str) -> StockStats {
        let keys = self.keys.lock().await;
        match keys.get(key) {
            Some(state) => StockStats {
                busy: state.busy,
                idle: state.idle.len(),
            },
            None => StockStats { busy: 0, idle: 0 },
        }
    }
}

/// An exclusive, single-use borrow of a stock item. Must be released
/// exactly once via [`Lease::release`]; dropping it without releasing
/// destroys the item (treated as "mid-response cancellation", i.e.
/// non-reusable).
pub struct Lease<T: Send + 'static> {
    stock: Arc<Stock<T>>,
    key: String,
    item: Option<T>,
}

impl<T: Send + 'static> Lease<T> {
    fn new(stock: Arc<Stock<T>>, key: String, item: T) -> Self {
        Lease {
            stock,
            key,
            item: Some(item),
        }
    }

    pub fn get(&self) -> &T {
        self.item.as_ref().expect("lease already released")
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("lease already released")
    }

    /// Releases the item back to the stock. `reuse = true` joins the idle
    /// set (subject to `max_idle`); `reuse = false` destroys it.
    pub async fn release(mut self, reuse: bool) {
        let item = self.item.take().expect("double release");
        let stock = self.stock.clone();
        let key = std::mem::take(&mut self.key);
        stock.put(&key, item, !reuse).await;
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            // Not explicitly released (cancellation mid-response): destroy
            // rather than guess at reusability, matching the original's
            // "release with reuse=false" cancellation contract.
            let stock = self.stock.clone();
            let key = std::mem::take(&mut self.key);
            tokio::spawn(async move {
                stock.put(&key, item, true).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClass {
        created: AtomicUsize,
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl StockClass<u32> for CountingClass {
        async fn create(&self, _key: &str) -> Result<u32, ProxyError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst) as u32)
        }

        fn borrow(&self, _item: &mut u32) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn busy_plus_idle_never_exceeds_limit() {
        let class = Arc::new(CountingClass {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let stock = Stock::with_idle_timeout(class, 2, 2, Duration::from_secs(300));

        let a = stock.get("k").await.unwrap();
        let b = stock.get("k").await.unwrap();
        let stats = stock.stats("k").await;
        assert_eq!(stats.busy, 2);
        assert!(stats.busy + stats.idle <= 2);

        a.release(true).await;
        b.release(true).await;
        let stats = stock.stats("k").await;
        assert_eq!(stats.idle, 2);
        assert!(stats.idle <= 2);
    }

    #[tokio::test]
    async fn fade_all_drops_idle_items() {
        let class = Arc::new(CountingClass {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let stock = Stock::with_idle_timeout(class, 5, 5, Duration::from_secs(300));
        let lease = stock.get("k").await.unwrap();
        lease.release(true).await;
        assert_eq!(stock.stats("k").await.idle, 1);

        stock.fade_all().await;
        assert_eq!(stock.stats("k").await.idle, 0);
    }

    #[tokio::test]
    async fn unhealthy_idle_item_is_replaced_transparently() {
        let class = Arc::new(CountingClass {
            created: AtomicUsize::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        });
        let stock = Stock::with_idle_timeout(class.clone(), 5, 5, Duration::from_secs(300));
        let lease = stock.get("k").await.unwrap();
        let first_id = *lease.get();
        lease.release(true).await;

        // Peer closed the idle connection.
        class.healthy.store(false, Ordering::SeqCst);
        let second = stock.get("k").await.unwrap();
        assert_ne!(*second.get(), first_id, "a fresh item must have been created");
    }
}
