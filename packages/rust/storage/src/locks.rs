//! Keyed async mutexes.
//!
//! One mutex per key (a canonical URL), created on first use. Waiters on the
//! same key queue in FIFO order; distinct keys never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for as long as the caller owns the key. Dropping releases it.
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Wait until `key` is free, then hold it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.slot(key).lock_owned().await
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Whether some task currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Drop slots nobody holds or waits on.
    pub fn prune(&self) {
        // `entry()` clones under the same shard lock `retain` holds, so a
        // count of 1 cannot race with a new locker.
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
