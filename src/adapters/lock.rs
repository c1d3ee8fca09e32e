//! Lock registries used by the scheduler.
//!
//! `InProcessLockRegistry` only excludes tasks inside one process. Multi-instance
//! deployments use `SqliteLeaseLockRegistry`, which keeps an expiring lease row
//! per lock name in the shared database.

use crate::adapters::sqlite::SqliteRepository;
use crate::domain::ports::{DistributedLock, LockRegistry};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct InProcessLock {
    name: String,
    held: AtomicBool,
}

#[async_trait]
impl DistributedLock for InProcessLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self) -> Result<bool> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn unlock(&self) -> Result<()> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

/// Hands out one shared lock object per name.
#[derive(Default)]
pub struct InProcessLockRegistry {
    locks: Mutex<HashMap<String, Arc<InProcessLock>>>,
}

impl InProcessLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockRegistry for InProcessLockRegistry {
    fn obtain(&self, name: &str) -> Arc<dyn DistributedLock> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(InProcessLock {
                    name: name.to_string(),
                    held: AtomicBool::new(false),
                })
            })
            .clone()
    }
}

pub struct SqliteLeaseLock {
    name: String,
    owner: String,
    lease: Duration,
    repository: Arc<SqliteRepository>,
}

#[async_trait]
impl DistributedLock for SqliteLeaseLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self) -> Result<bool> {
        self.repository
            .try_acquire_lease(&self.name, &self.owner, self.lease)
            .map_err(|e| EtlError::LockError {
                message: format!("failed to acquire lease '{}': {}", self.name, e),
            })
    }

    async fn unlock(&self) -> Result<()> {
        let released = self
            .repository
            .release_lease(&self.name, &self.owner)
            .map_err(|e| EtlError::LockError {
                message: format!("failed to release lease '{}': {}", self.name, e),
            })?;
        if !released {
            tracing::warn!(
                "Lease '{}' was no longer held by {} at release (expired and taken over?)",
                self.name,
                self.owner
            );
        }
        Ok(())
    }

    fn renew_every(&self) -> Option<Duration> {
        Some(self.lease / 3)
    }

    async fn extend(&self) -> Result<bool> {
        // Same owner: the upsert only moves expires_at forward
        self.repository
            .try_acquire_lease(&self.name, &self.owner, self.lease)
            .map_err(|e| EtlError::LockError {
                message: format!("failed to renew lease '{}': {}", self.name, e),
            })
    }
}

/// Lease-backed locks. Each registry instance acts as one owner.
pub struct SqliteLeaseLockRegistry {
    owner: String,
    lease: Duration,
    repository: Arc<SqliteRepository>,
}

impl SqliteLeaseLockRegistry {
    pub fn new(repository: Arc<SqliteRepository>, lease: Duration) -> Self {
        Self {
            owner: format!("worker-{}", uuid::Uuid::new_v4()),
            lease,
            repository,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl LockRegistry for SqliteLeaseLockRegistry {
    fn obtain(&self, name: &str) -> Arc<dyn DistributedLock> {
        Arc::new(SqliteLeaseLock {
            name: name.to_string(),
            owner: self.owner.clone(),
            lease: self.lease,
            repository: self.repository.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_lock_is_non_blocking() {
        let registry = InProcessLockRegistry::new();
        let first = registry.obtain("review-processing");
        let second = registry.obtain("review-processing");
        let other = registry.obtain("review-cleanup");

        assert!(first.try_lock().await.unwrap());
        assert!(!second.try_lock().await.unwrap());
        assert!(other.try_lock().await.unwrap());

        first.unlock().await.unwrap();
        assert!(second.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_lock_excludes_other_registries() {
        let repository = Arc::new(SqliteRepository::in_memory().unwrap());
        let worker_a = SqliteLeaseLockRegistry::new(repository.clone(), Duration::from_secs(60));
        let worker_b = SqliteLeaseLockRegistry::new(repository, Duration::from_secs(60));
        assert_ne!(worker_a.owner(), worker_b.owner());

        let lock_a = worker_a.obtain("review-processing");
        let lock_b = worker_b.obtain("review-processing");

        assert!(lock_a.try_lock().await.unwrap());
        assert!(!lock_b.try_lock().await.unwrap());

        // Releasing someone else's lease is a no-op.
        lock_b.unlock().await.unwrap();
        assert!(!lock_b.try_lock().await.unwrap());

        lock_a.unlock().await.unwrap();
        assert!(lock_b.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_keeps_lease_past_its_ttl() {
        let repository = Arc::new(SqliteRepository::in_memory().unwrap());
        let lease = Duration::from_millis(300);
        let lock_a = SqliteLeaseLockRegistry::new(repository.clone(), lease).obtain("review-processing");
        let lock_b = SqliteLeaseLockRegistry::new(repository, lease).obtain("review-processing");
        assert_eq!(lock_a.renew_every(), Some(Duration::from_millis(100)));

        assert!(lock_a.try_lock().await.unwrap());
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(lock_a.extend().await.unwrap());
        }
        // 600ms in, twice the lease, still held by A
        assert!(!lock_b.try_lock().await.unwrap());

        // Without renewal the lease lapses and B takes over; A notices on extend
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(lock_b.try_lock().await.unwrap());
        assert!(!lock_a.extend().await.unwrap());
    }

    #[tokio::test]
    async fn test_in_process_lock_never_needs_renewal() {
        let lock = InProcessLockRegistry::new().obtain("review-processing");
        assert!(lock.renew_every().is_none());
        assert!(lock.try_lock().await.unwrap());
        assert!(lock.extend().await.unwrap());
    }
}
