use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A set of async mutexes addressed by key.
///
/// Different keys never contend. Waiters on the same key are served in arrival order. Entries
/// are dropped once nobody holds or waits for them.
#[derive(Debug)]
pub struct KeyedLock<K> {
    locks: Arc<Mutex<HashMap<K, Weak<AsyncMutex<()>>>>>,
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits until the lock for `key` is free and takes it.
    pub async fn lock(&self, key: &K) -> KeyedGuard {
        let mutex = self.mutex_for(key);

        KeyedGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Takes the lock for `key` only if it is free right now.
    pub fn try_lock(&self, key: &K) -> Option<KeyedGuard> {
        let mutex = self.mutex_for(key);

        mutex
            .try_lock_owned()
            .ok()
            .map(|guard| KeyedGuard { _guard: guard })
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        locks.values().filter(|lock| lock.strong_count() > 0).count()
    }

    fn mutex_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);

        if let Some(mutex) = locks.get(key).and_then(Weak::upgrade) {
            return mutex;
        }

        let mutex = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&mutex));

        mutex
    }
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the key when dropped.
#[derive(Debug)]
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
}
