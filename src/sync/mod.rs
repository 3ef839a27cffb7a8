//! Named mutual exclusion.
//!
//! Serializes mutations per shard map without one global lock: each key gets
//! its own async mutex, created on first use and dropped again when the last
//! holder or waiter releases it, so the registry never grows with the number
//! of keys seen over the process lifetime.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug)]
struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    // Holders plus waiters. The slot is removed when this drops to zero.
    refs: usize,
}

/// Registry of reference-counted named async mutexes.
#[derive(Debug)]
pub struct NamedLockRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    slots: Arc<Mutex<HashMap<K, Slot>>>,
}

impl<K> NamedLockRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the mutex named `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: K) -> NamedLockGuard<K> {
        let mutex = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.mutex)
        };

        let guard = mutex.lock_owned().await;
        NamedLockGuard {
            key,
            slots: Arc::clone(&self.slots),
            _guard: guard,
        }
    }

    /// Number of live slots. Test observability.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot is live.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<K> Default for NamedLockRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the mutex named by its key; releasing drops the reference count and
/// removes the slot when nobody else holds or waits.
#[derive(Debug)]
pub struct NamedLockGuard<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    key: K,
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl<K> Drop for NamedLockGuard<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let registry = Arc::new(NamedLockRegistry::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("orders").await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let registry = NamedLockRegistry::new();
        let _a = registry.acquire("a").await;
        // Would deadlock if keys shared a mutex.
        let _b = registry.acquire("b").await;
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_shrinks_after_release() {
        let registry = NamedLockRegistry::new();
        {
            let _guard = registry.acquire("orders").await;
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
