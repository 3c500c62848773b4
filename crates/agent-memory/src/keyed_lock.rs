//! Per-key mutual exclusion for read-then-write sequences.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// A mutex per string key, created on first use and dropped once no caller
/// holds or waits on it.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub(crate) fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        // Clone out of the entry so the shard lock is released before we block.
        let slot = self.slots.entry(key.to_string()).or_default().clone();

        let out = {
            let _guard = slot.lock();
            f()
        };

        // Only the map and this call hold the slot: nobody else is waiting.
        self.slots
            .remove_if(key, |_, held| Arc::strong_count(held) == 2);
        out
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}
