use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::Notify;

struct AwaitSlot<V> {
    value: OnceCell<V>,
    ready: Notify,
}

/// Per-key one-shot values: `set` fires exactly once per key, `wait` blocks
/// until it has and late waiters see the value immediately. Used for
/// diagnostics that arrive as unsolicited notifications.
pub struct AwaitCache<K, V> {
    slots: DashMap<K, Arc<AwaitSlot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for AwaitCache<K, V> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> AwaitCache<K, V> {
    fn slot(&self, key: &K) -> Arc<AwaitSlot<V>> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(AwaitSlot {
                    value: OnceCell::new(),
                    ready: Notify::new(),
                })
            })
            .clone()
    }

    /// Returns false when the key was already set; the first value wins.
    pub fn set(&self, key: K, value: V) -> bool {
        let slot = self.slot(&key);
        let fresh = slot.value.set(value).is_ok();
        if fresh {
            slot.ready.notify_waiters();
        }
        fresh
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.slots
            .get(key)
            .and_then(|slot| slot.value.get().cloned())
    }

    pub async fn wait(&self, key: &K) -> V {
        let slot = self.slot(key);
        loop {
            // register interest before checking, so a concurrent set can't
            // slip between the check and the await
            let notified = slot.ready.notified();
            if let Some(value) = slot.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }

    pub fn remove(&self, key: &K) {
        self.slots.remove(key);
    }
}
