//! Named global advisory locks.
//!
//! Long-running control-plane segments (per-distro scheduling and
//! dispatching, the monitor sweep) are gated by named locks owned by a
//! single process at a time. Locks carry a time-to-live so a crashed owner
//! releases them implicitly; the API hot path never takes one.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::storage::{Storage, StorageResult};

/// Time-to-live after which an unreleased lock may be taken over.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

/// Poll interval while waiting to acquire.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to one named lock.
pub struct NamedLock {
    storage: Arc<dyn Storage>,
    name: String,
    owner: String,
    ttl: Duration,
}

impl NamedLock {
    /// Create a handle with a process-unique owner id and the default TTL.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
            owner: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
            ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Override the TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try once to acquire the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn try_acquire(&self) -> StorageResult<bool> {
        self.storage
            .try_acquire_lock(&self.name, &self.owner, self.ttl)
            .await
    }

    /// Wait up to `wait` for the lock, polling periodically. Returns
    /// `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn acquire(&self, wait: Duration) -> StorageResult<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire().await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(wait)).await;
        }
    }

    /// Release the lock.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the lock is held by another owner.
    pub async fn release(&self) -> StorageResult<()> {
        self.storage.release_lock(&self.name, &self.owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[tokio::test]
    async fn test_exclusive_ownership() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let first = NamedLock::new(Arc::clone(&storage), "dispatch.linux-64");
        let second = NamedLock::new(Arc::clone(&storage), "dispatch.linux-64");

        assert!(first.try_acquire().await.unwrap());
        assert!(!second.try_acquire().await.unwrap());

        first.release().await.unwrap();
        assert!(second.try_acquire().await.unwrap());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reacquire_by_same_owner() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let lock = NamedLock::new(Arc::clone(&storage), "monitor");

        assert!(lock.try_acquire().await.unwrap());
        assert!(lock.try_acquire().await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let holder = NamedLock::new(Arc::clone(&storage), "scheduler");
        let waiter = NamedLock::new(Arc::clone(&storage), "scheduler");

        assert!(holder.try_acquire().await.unwrap());
        assert!(!waiter.acquire(Duration::from_millis(10)).await.unwrap());
    }
}
