//! File tracking ledger: the idempotency state machine for source files.
//!
//! Rows are addressed by the id handed out at claim time. Every transition is
//! a compare-and-set in the repository, so two workers racing on the same row
//! cannot both win.

use crate::domain::model::{FileMetadata, FileRecord, FileStatus, ObjectSummary};
use crate::domain::ports::{FileRecordRepository, TransitionUpdate};
use crate::utils::error::{EtlError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_STUCK_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const CANCELLED_MESSAGE: &str = "Cancelled by operator";

pub struct FileTracker {
    repository: Arc<dyn FileRecordRepository>,
}

impl FileTracker {
    pub fn new(repository: Arc<dyn FileRecordRepository>) -> Self {
        Self { repository }
    }

    /// Keeps candidates that have never been seen, plus those whose latest
    /// attempt was claimed but never started.
    pub async fn filter_unprocessed(
        &self,
        candidates: Vec<ObjectSummary>,
    ) -> Result<Vec<ObjectSummary>> {
        let total = candidates.len();
        let mut unprocessed = Vec::with_capacity(total);
        for candidate in candidates {
            let latest = self
                .repository
                .find_by_key_and_fingerprint(&candidate.key, &candidate.fingerprint)
                .await?;
            match latest {
                None => unprocessed.push(candidate),
                Some(record) if record.status == FileStatus::Pending => unprocessed.push(candidate),
                Some(record) => tracing::debug!(
                    "Skipping {} ({}): already {}",
                    candidate.key,
                    candidate.fingerprint,
                    record.status
                ),
            }
        }
        tracing::debug!("{} of {} candidates need processing", unprocessed.len(), total);
        Ok(unprocessed)
    }

    /// True iff any ledger row exists for the exact pair, whatever its status.
    pub async fn is_duplicate(&self, source_key: &str, fingerprint: &str) -> Result<bool> {
        self.repository
            .exists_by_key_and_fingerprint(source_key, fingerprint)
            .await
    }

    /// Create-or-fetch. An existing row for the pair comes back unchanged.
    pub async fn claim(
        &self,
        source_key: &str,
        fingerprint: &str,
        metadata: &FileMetadata,
    ) -> Result<FileRecord> {
        let record = self
            .repository
            .insert_if_absent(source_key, fingerprint, metadata)
            .await?;
        tracing::debug!(
            "Claimed {} ({}) as record {} [{}]",
            source_key,
            fingerprint,
            record.id,
            record.status
        );
        Ok(record)
    }

    pub async fn mark_started(&self, record: &FileRecord) -> Result<FileRecord> {
        let update = TransitionUpdate {
            started_at: Some(Utc::now()),
            ..TransitionUpdate::default()
        };
        self.transition(record.id, &[FileStatus::Pending], FileStatus::InProgress, update)
            .await
    }

    pub async fn mark_completed(
        &self,
        record: &FileRecord,
        processed: u64,
        failed: u64,
    ) -> Result<FileRecord> {
        let update = TransitionUpdate {
            completed_at: Some(Utc::now()),
            counts: Some((processed, failed)),
            ..TransitionUpdate::default()
        };
        self.transition(record.id, &[FileStatus::InProgress], FileStatus::Completed, update)
            .await
    }

    pub async fn mark_failed(&self, record: &FileRecord, message: &str) -> Result<FileRecord> {
        self.fail(record.id, message, None).await
    }

    /// Like `mark_failed`, also storing the counts reached so far.
    pub async fn mark_failed_with_counts(
        &self,
        record: &FileRecord,
        message: &str,
        processed: u64,
        failed: u64,
    ) -> Result<FileRecord> {
        self.fail(record.id, message, Some((processed, failed)))
            .await
    }

    async fn fail(&self, id: i64, message: &str, counts: Option<(u64, u64)>) -> Result<FileRecord> {
        let update = TransitionUpdate {
            completed_at: Some(Utc::now()),
            error_message: Some(message.to_string()),
            counts,
            ..TransitionUpdate::default()
        };
        self.transition(
            id,
            &[FileStatus::Pending, FileStatus::InProgress],
            FileStatus::Failed,
            update,
        )
        .await
    }

    /// Live counters for an in-flight file. A row that has left `IN_PROGRESS`
    /// (for example cancelled by an operator) is left alone.
    pub async fn record_progress(&self, record: &FileRecord, processed: u64, failed: u64) -> Result<()> {
        if !self
            .repository
            .update_progress(record.id, processed, failed)
            .await?
        {
            tracing::debug!(
                "Progress for record {} not stored: no longer in progress",
                record.id
            );
        }
        Ok(())
    }

    pub async fn find_stuck(&self, timeout: Duration) -> Result<Vec<FileRecord>> {
        let cutoff = Utc::now() - to_chrono(timeout)?;
        self.repository.find_stuck(cutoff).await
    }

    /// Forces every stuck row to `FAILED` and returns the recovered rows.
    pub async fn recover_stuck(&self, timeout: Duration) -> Result<Vec<FileRecord>> {
        let message = format!(
            "Processing timeout: no completion within {}",
            format_duration(timeout)
        );
        let mut recovered = Vec::new();
        for record in self.find_stuck(timeout).await? {
            let update = TransitionUpdate {
                completed_at: Some(Utc::now()),
                error_message: Some(message.clone()),
                ..TransitionUpdate::default()
            };
            match self
                .transition(record.id, &[FileStatus::InProgress], FileStatus::Failed, update)
                .await
            {
                Ok(failed) => {
                    tracing::warn!(
                        "⏰ Recovered stuck record {} ({}) started at {:?}",
                        failed.id,
                        failed.source_key,
                        record.processing_started_at
                    );
                    recovered.push(failed);
                }
                // Finished between the lookup and the update
                Err(EtlError::IllegalTransition { .. }) | Err(EtlError::RecordNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Deletes terminal rows older than `retention`; active rows are never touched.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - to_chrono(retention)?;
        let deleted = self.repository.delete_terminal_older_than(cutoff).await?;
        if deleted > 0 {
            tracing::info!("Deleted {} ledger rows older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Marks a pending or running record `CANCELLED`. A worker still running
    /// the file is not interrupted; its final transition will be rejected.
    pub async fn stop(&self, id: i64) -> Result<FileRecord> {
        let update = TransitionUpdate {
            completed_at: Some(Utc::now()),
            error_message: Some(CANCELLED_MESSAGE.to_string()),
            ..TransitionUpdate::default()
        };
        let record = self
            .transition(
                id,
                &[FileStatus::Pending, FileStatus::InProgress],
                FileStatus::Cancelled,
                update,
            )
            .await?;
        tracing::info!("🛑 Record {} ({}) cancelled", record.id, record.source_key);
        Ok(record)
    }

    /// New `PENDING` attempt for a failed or cancelled record. The old row
    /// stays as it is.
    pub async fn create_retry(&self, id: i64) -> Result<FileRecord> {
        let previous = self.status(id).await?;
        if !matches!(previous.status, FileStatus::Failed | FileStatus::Cancelled) {
            return Err(EtlError::IllegalTransition {
                id,
                from: previous.status.to_string(),
                to: FileStatus::Pending.to_string(),
            });
        }

        let retry = self
            .repository
            .insert_retry_attempt(&previous)
            .await?
            .ok_or(EtlError::AlreadyRunning { id })?;
        tracing::info!(
            "🔁 Created attempt {} for {} as record {}",
            retry.attempt,
            retry.source_key,
            retry.id
        );
        Ok(retry)
    }

    pub async fn status(&self, id: i64) -> Result<FileRecord> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or(EtlError::RecordNotFound { id })
    }

    pub async fn list(&self, status: Option<FileStatus>, limit: usize) -> Result<Vec<FileRecord>> {
        self.repository.find_by_status(status, limit).await
    }

    async fn transition(
        &self,
        id: i64,
        from: &[FileStatus],
        to: FileStatus,
        update: TransitionUpdate,
    ) -> Result<FileRecord> {
        if self.repository.transition(id, from, to, update).await? {
            tracing::debug!("Record {} -> {}", id, to);
            return self.status(id).await;
        }

        match self.repository.find_by_id(id).await? {
            None => Err(EtlError::RecordNotFound { id }),
            Some(current) => Err(EtlError::IllegalTransition {
                id,
                from: current.status.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| EtlError::InvalidConfigValueError {
        field: "duration".to_string(),
        value: format!("{:?}", duration),
        reason: e.to_string(),
    })
}

/// `2h`, `90m`, `45s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
