use crate::domain::model::{
    BatchResult, CanonicalReview, CleanupSummary, FileMetadata, FileRecord, FileStatus,
    ObjectSummary, Provider, ProviderStatistics,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Streamed object body.
pub type ByteStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub next_token: Option<String>,
}

/// Raw object store access. Read-only: nothing here mutates remote state.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage>;

    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Returns `Ok(None)` when the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectSummary>>;
}

/// Fields written together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub counts: Option<(u64, u64)>,
}

#[async_trait]
pub trait FileRecordRepository: Send + Sync {
    /// Atomic check-and-insert of attempt 1 for the pair; returns the latest
    /// attempt for the pair whether or not a row was inserted.
    async fn insert_if_absent(
        &self,
        source_key: &str,
        fingerprint: &str,
        metadata: &FileMetadata,
    ) -> Result<FileRecord>;

    /// Inserts the next attempt for `previous`'s pair, unless some attempt of
    /// that pair is still non-terminal.
    async fn insert_retry_attempt(&self, previous: &FileRecord) -> Result<Option<FileRecord>>;

    async fn find_by_id(&self, id: i64) -> Result<Option<FileRecord>>;

    async fn find_by_key_and_fingerprint(
        &self,
        source_key: &str,
        fingerprint: &str,
    ) -> Result<Option<FileRecord>>;

    async fn exists_by_key_and_fingerprint(&self, source_key: &str, fingerprint: &str)
        -> Result<bool>;

    async fn find_by_status(&self, status: Option<FileStatus>, limit: usize)
        -> Result<Vec<FileRecord>>;

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<FileRecord>>;

    /// Compare-and-set on status. Returns `false` when the row is missing or
    /// its current status is not in `from`.
    async fn transition(
        &self,
        id: i64,
        from: &[FileStatus],
        to: FileStatus,
        update: TransitionUpdate,
    ) -> Result<bool>;

    async fn update_progress(&self, id: i64, processed: u64, failed: u64) -> Result<bool>;

    /// Deletes terminal rows created before `cutoff`.
    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    async fn find_by_code(&self, code: &str) -> Result<Option<Provider>>;

    /// Upsert guarded by the unique provider code.
    async fn insert_or_get(&self, code: &str, name: &str) -> Result<Provider>;
}

#[async_trait]
pub trait ReviewRepository: Send + Sync {
    async fn exists_by_external_id(&self, provider_id: i64, external_review_id: i64)
        -> Result<bool>;

    /// Writes all rows in one transaction and returns the number inserted.
    /// Rows colliding with an existing `(provider, external id)` are ignored.
    async fn insert_batch(&self, reviews: &[CanonicalReview]) -> Result<u64>;

    async fn provider_statistics(&self) -> Result<Vec<ProviderStatistics>>;
}

/// Fire-and-forget observability hooks.
pub trait MetricsSink: Send + Sync {
    fn file_started(&self, key: &str);
    fn file_completed(&self, key: &str, processed: u64, failed: u64);
    fn file_failed(&self, key: &str, reason: &str);
    fn batch_processed(&self, key: &str, result: &BatchResult);
    fn cleanup_started(&self);
    fn cleanup_completed(&self, summary: &CleanupSummary);
    fn cleanup_skipped(&self);
    fn processing_skipped(&self);
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    fn name(&self) -> &str;

    /// Non-blocking acquire.
    async fn try_lock(&self) -> Result<bool>;

    async fn unlock(&self) -> Result<()>;

    /// How often a holder must call [`extend`](Self::extend) to keep the
    /// lock. `None` for locks that never expire.
    fn renew_every(&self) -> Option<Duration> {
        None
    }

    /// Pushes the expiry of a held lock forward. `Ok(false)` means the lock
    /// was lost in the meantime.
    async fn extend(&self) -> Result<bool> {
        Ok(true)
    }
}

pub trait LockRegistry: Send + Sync {
    fn obtain(&self, name: &str) -> Arc<dyn DistributedLock>;
}
