//! Per-key async exclusion.
//!
//! A [`KeyedLock`] hands out independent locks for arbitrary hashable keys:
//! tasks locking the same key serialize in FIFO order, tasks locking
//! different keys never contend. The map entry for a key is removed once the
//! last holder or waiter for that key is gone, so the table stays bounded by
//! the number of keys currently in flight.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    // Holders plus queued waiters. The entry is dropped when this hits zero.
    refs: usize,
}

/// A lock manager indexed by arbitrary hashable keys.
///
/// Typical use is serializing mutations per content digest or per key-space
/// bucket while leaving unrelated digests fully parallel:
///
/// ```ignore
/// let guard = locks.lock(digest.clone()).await;
/// // exclusive for this digest until `guard` drops
/// ```
pub struct KeyedLock<K: Eq + Hash + Clone> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting in FIFO order behind earlier
    /// claimants of the same key.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mutex = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.mutex)
        };

        // Registered in the map before awaiting; if this future is dropped
        // while queued, the tracker still decrements the count.
        let tracker = RefTracker {
            lock: self,
            key: Some(key),
        };

        let guard = mutex.lock_owned().await;

        KeyedGuard {
            _guard: guard,
            _tracker: tracker,
        }
    }

    fn release_ref(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn active_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

struct RefTracker<'a, K: Eq + Hash + Clone> {
    lock: &'a KeyedLock<K>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> Drop for RefTracker<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.lock.release_ref(&key);
        }
    }
}

/// Guard returned by [`KeyedLock::lock`]; releases the key on drop.
///
/// Field order matters: the mutex guard drops first (waking the next FIFO
/// waiter) and only then is the reference count decremented.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    _guard: OwnedMutexGuard<()>,
    _tracker: RefTracker<'a, K>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lock_is_exclusive_per_key() {
        let lock = Arc::new(KeyedLock::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = lock.lock("same-key").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let lock = Arc::new(KeyedLock::new());

        let guard_a = lock.lock("a").await;
        // Must not deadlock even while "a" is held.
        let guard_b = lock.lock("b").await;
        drop(guard_a);
        drop(guard_b);

        assert_eq!(lock.active_keys(), 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let lock = Arc::new(KeyedLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock.lock(0u8).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = lock.lock(0u8).await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next spawns.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn entry_is_removed_when_last_waiter_leaves() {
        let lock = KeyedLock::new();
        {
            let _guard = lock.lock(String::from("k")).await;
            assert_eq!(lock.active_keys(), 1);
        }
        assert_eq!(lock.active_keys(), 0);
    }
}
