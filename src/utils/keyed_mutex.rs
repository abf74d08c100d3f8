use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A mutex that locks on a key (here: a file identity `profile/bucket/key`).
/// Admission control needs exactly one in-flight attempt per identity, but a
/// global lock would let one file's multi-minute backoff starve every other
/// arrival. Keyed locking lets unrelated identities proceed in parallel.
#[derive(Debug, Clone, Default)]
pub struct KeyedMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires the lock for the given key.
    /// The lock is released when the returned guard is dropped.
    pub async fn lock(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        // The inner Arc<Mutex> is held by the DashMap, so it won't disappear
        // while we wait. Entries accumulate per distinct identity; cleanup()
        // drops the ones nobody holds.
        mutex.lock_owned().await
    }

    /// Removes locks that are not currently held by any task.
    pub fn cleanup(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}
