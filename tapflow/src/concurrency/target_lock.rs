use metrics::histogram;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::concurrency::keyed_lock::{KeyedGuard, KeyedLock};
use crate::error::{ErrorKind, TapflowResult};
use crate::metrics::TAPFLOW_LOCK_WAIT_SECONDS;
use crate::tapflow_error;

/// Registry of destination locks shared by all runs of a controller.
///
/// Holders of the same key never write to the destination at the same time.
#[derive(Debug, Clone, Default)]
pub struct TargetLocks {
    locks: KeyedLock<String>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for `key`.
    ///
    /// Fails with [`ErrorKind::LockContentionTimeout`] when the lock is still held by someone
    /// else after `timeout`.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> TapflowResult<TargetLockGuard> {
        let key = key.to_string();
        let started = Instant::now();

        let guard = tokio::time::timeout(timeout, self.locks.lock(&key))
            .await
            .map_err(|_| {
                tapflow_error!(
                    ErrorKind::LockContentionTimeout,
                    "Target lock is held by another run",
                    format!("key `{key}` still busy after {timeout:?}")
                )
            })?;

        histogram!(TAPFLOW_LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(lock_key = %key, waited = ?started.elapsed(), "acquired target lock");

        Ok(TargetLockGuard { key, _guard: guard })
    }
}

/// Held target lock. Released on drop.
#[derive(Debug)]
pub struct TargetLockGuard {
    key: String,
    _guard: KeyedGuard,
}

impl TargetLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TargetLockGuard {
    fn drop(&mut self) {
        debug!(lock_key = %self.key, "released target lock");
    }
}

/// Key of the table scoped lock used during bulk transfers.
pub fn table_lock_key(target_lock_key: &str, stream: &str) -> String {
    format!("{target_lock_key}/{stream}")
}
