use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::scm::ResourceKey;

/// Serializes work on the same merge request. Different keys never block each other.
///
/// Locks are created on first use and kept for the lifetime of the manager, so the registry
/// grows with the number of distinct merge requests seen by the process.
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
}

impl LockManager {
    /// Waits until no one else holds the lock for `key`. The lock is released when the guard is
    /// dropped, including during unwinding and task cancellation.
    pub async fn lock(&self, key: &ResourceKey) -> OwnedMutexGuard<()> {
        // The map shard is unlocked before waiting on the merge request lock.
        let lock = Arc::clone(&self.locks.entry(key.clone()).or_default());
        tracing::debug!("Acquiring lock for {key}");
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
