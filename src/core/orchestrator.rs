//! Drives one file (or one cycle of files) through listing, claiming,
//! streaming, batch processing and the final ledger transition.

use crate::core::batch::BatchProcessor;
use crate::core::gateway::ObjectStoreGateway;
use crate::core::ledger::FileTracker;
use crate::core::parser::{RecordStream, DEFAULT_BATCH_SIZE};
use crate::domain::model::{
    CleanupSummary, CycleSummary, FileMetadata, FileOutcome, FileRecord, FileStatus,
    ObjectSummary, ProviderStatistics,
};
use crate::domain::ports::{MetricsSink, ReviewRepository};
use crate::utils::error::{EtlError, Result};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::BufReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub prefix: String,
    pub batch_size: usize,
    /// Failed records tolerated per file before it is abandoned.
    pub error_threshold: u64,
    pub max_concurrent_files: usize,
    pub prioritize_by_key_date: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            prefix: "reviews/".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            error_threshold: 50,
            max_concurrent_files: 1,
            prioritize_by_key_date: true,
        }
    }
}

/// Counters for one file while it streams.
#[derive(Debug, Default)]
struct FileTotals {
    processed: u64,
    failed: u64,
    aborted: Option<String>,
}

pub struct Orchestrator {
    gateway: ObjectStoreGateway,
    tracker: FileTracker,
    processor: BatchProcessor,
    reviews: Arc<dyn ReviewRepository>,
    metrics: Arc<dyn MetricsSink>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        gateway: ObjectStoreGateway,
        tracker: FileTracker,
        processor: BatchProcessor,
        reviews: Arc<dyn ReviewRepository>,
        metrics: Arc<dyn MetricsSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            gateway,
            tracker,
            processor,
            reviews,
            metrics,
            config,
        }
    }

    pub fn tracker(&self) -> &FileTracker {
        &self.tracker
    }

    /// Lists, filters and processes every pending file under the prefix.
    /// A failing file is counted and logged; only listing errors escape.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let candidates = self.gateway.list_candidates(&self.config.prefix).await?;
        let total = candidates.len();
        let mut pending = self.tracker.filter_unprocessed(candidates).await?;
        if self.config.prioritize_by_key_date {
            sort_by_key_date(&mut pending);
        }

        let mut summary = CycleSummary {
            candidates: total,
            skipped: total - pending.len(),
            ..CycleSummary::default()
        };
        tracing::info!(
            "🔍 Found {} candidate files under '{}', {} to process",
            total,
            self.config.prefix,
            pending.len()
        );

        if self.config.max_concurrent_files <= 1 {
            for object in &pending {
                let result = self.process_candidate(object).await;
                tally(&mut summary, object, result);
            }
        } else {
            let results: Vec<_> = stream::iter(pending.iter().cloned())
                .map(|object| async move {
                    let result = self.process_candidate(&object).await;
                    (object, result)
                })
                .buffer_unordered(self.config.max_concurrent_files)
                .collect()
                .await;
            for (object, result) in results {
                tally(&mut summary, &object, result);
            }
        }

        tracing::info!(
            "Cycle finished: {} completed, {} failed, {} skipped",
            summary.completed,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Claims and starts the object, then processes it. `Ok(None)` means the
    /// file is owned elsewhere or already finished.
    pub async fn process_candidate(&self, object: &ObjectSummary) -> Result<Option<FileOutcome>> {
        let metadata = FileMetadata::from_summary(object);
        let record = self
            .tracker
            .claim(&object.key, &object.fingerprint, &metadata)
            .await?;
        if record.status != FileStatus::Pending {
            tracing::debug!("Skipping {}: record {} is {}", object.key, record.id, record.status);
            return Ok(None);
        }

        let record = match self.tracker.mark_started(&record).await {
            Ok(record) => record,
            Err(EtlError::IllegalTransition { from, .. }) => {
                tracing::info!(
                    "Skipping {}: record {} was taken by another worker ({})",
                    object.key,
                    record.id,
                    from
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.process_file(&record).await.map(Some)
    }

    /// Processes a record that is already `IN_PROGRESS` and moves it to its
    /// terminal state. Download and persistence errors mark the record
    /// `FAILED` and are returned to the caller.
    pub async fn process_file(&self, record: &FileRecord) -> Result<FileOutcome> {
        let key = record.source_key.as_str();
        self.metrics.file_started(key);

        let totals = match self.ingest(record).await {
            Ok(totals) => totals,
            Err(e) => {
                let message = e.to_string();
                self.metrics.file_failed(key, &message);
                if let Err(mark_err) = self.tracker.mark_failed(record, &message).await {
                    tracing::error!(
                        "Could not mark record {} as failed: {}",
                        record.id,
                        mark_err
                    );
                }
                return Err(e);
            }
        };

        let message = match totals.aborted {
            Some(reason) => Some(reason),
            None if totals.failed > 0 => Some(format!("{} records failed", totals.failed)),
            None => None,
        };

        let stored = match &message {
            None => {
                let stored = self
                    .tracker
                    .mark_completed(record, totals.processed, totals.failed)
                    .await?;
                self.metrics
                    .file_completed(key, totals.processed, totals.failed);
                stored
            }
            Some(reason) => {
                let stored = self
                    .tracker
                    .mark_failed_with_counts(record, reason, totals.processed, totals.failed)
                    .await?;
                self.metrics.file_failed(key, reason);
                stored
            }
        };

        Ok(FileOutcome {
            record_id: stored.id,
            source_key: stored.source_key,
            status: stored.status,
            records_processed: totals.processed,
            records_failed: totals.failed,
            message,
        })
    }

    async fn ingest(&self, record: &FileRecord) -> Result<FileTotals> {
        let key = record.source_key.as_str();
        if !self.gateway.exists(key).await? {
            return Err(EtlError::NotFound {
                key: key.to_string(),
            });
        }

        let body = self.gateway.download(key).await?;
        let mut records = RecordStream::new(BufReader::new(body), self.config.batch_size);
        let mut totals = FileTotals::default();
        let mut invalid = 0u64;

        while let Some(batch) = records.next_batch().await? {
            // Malformed lines of this batch were counted while reading it
            let failed_before = invalid + records.stats().malformed_lines as u64;
            if failed_before > self.config.error_threshold {
                totals.failed = failed_before;
                totals.aborted = Some(self.budget_reason(key, totals.failed));
                return Ok(totals);
            }

            let budget = self.config.error_threshold - failed_before;
            let result = self.processor.process_batch_within(batch, budget).await;
            self.metrics.batch_processed(key, &result);
            totals.processed += result.processed;
            invalid += result.invalid;

            if let Some(reason) = result.persistence_error {
                return Err(EtlError::persistence(reason));
            }

            totals.failed = invalid + records.stats().malformed_lines as u64;
            self.tracker
                .record_progress(record, totals.processed, totals.failed)
                .await?;

            if result.budget_exhausted || totals.failed > self.config.error_threshold {
                totals.aborted = Some(self.budget_reason(key, totals.failed));
                return Ok(totals);
            }
        }

        totals.failed = invalid + records.stats().malformed_lines as u64;
        if totals.failed > self.config.error_threshold {
            totals.aborted = Some(self.budget_reason(key, totals.failed));
        }
        Ok(totals)
    }

    fn budget_reason(&self, key: &str, failed: u64) -> String {
        let reason = format!(
            "Too many validation errors: {} exceeds threshold {}",
            failed, self.config.error_threshold
        );
        tracing::warn!("⚠️ Aborting {}: {}", key, reason);
        reason
    }

    /// Creates a new attempt for a failed or cancelled record and runs it now.
    pub async fn retry(&self, id: i64) -> Result<FileOutcome> {
        let attempt = self.tracker.create_retry(id).await?;
        let attempt = self.tracker.mark_started(&attempt).await?;
        self.process_file(&attempt).await
    }

    pub async fn stop(&self, id: i64) -> Result<FileRecord> {
        self.tracker.stop(id).await
    }

    pub async fn status(&self, id: i64) -> Result<FileRecord> {
        self.tracker.status(id).await
    }

    pub async fn list_statuses(
        &self,
        status: Option<FileStatus>,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        self.tracker.list(status, limit).await
    }

    pub async fn provider_statistics(&self) -> Result<Vec<ProviderStatistics>> {
        self.reviews.provider_statistics().await
    }

    /// Stuck-job recovery followed by retention cleanup.
    pub async fn cleanup(&self, stuck_timeout: Duration, retention: Duration) -> Result<CleanupSummary> {
        let recovered = self.tracker.recover_stuck(stuck_timeout).await?;
        for record in &recovered {
            self.metrics.file_failed(
                &record.source_key,
                record.error_message.as_deref().unwrap_or("processing timeout"),
            );
        }
        let deleted = self.tracker.cleanup(retention).await?;
        Ok(CleanupSummary {
            recovered: recovered.len(),
            deleted,
        })
    }
}

fn tally(summary: &mut CycleSummary, object: &ObjectSummary, result: Result<Option<FileOutcome>>) {
    match result {
        Ok(None) => summary.skipped += 1,
        Ok(Some(outcome)) if outcome.status == FileStatus::Completed => summary.completed += 1,
        Ok(Some(outcome)) => {
            summary.failed += 1;
            tracing::warn!(
                "{} finished as {}: {}",
                outcome.source_key,
                outcome.status,
                outcome.message.as_deref().unwrap_or("-")
            );
        }
        Err(e) => {
            summary.failed += 1;
            tracing::error!(
                "❌ {} failed: {} (Category: {:?}, Severity: {:?})",
                object.key,
                e,
                e.category(),
                e.severity()
            );
        }
    }
}

/// First `YYYY-MM-DD`, `YYYY/MM/DD` or `YYYY/MM` date embedded in a key.
pub fn key_date(key: &str) -> Option<NaiveDate> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(\d{4})[-/](\d{2})(?:[-/](\d{2}))?").ok())
        .as_ref()?;

    pattern.captures_iter(key).find_map(|caps| {
        let year = caps.get(1)?.as_str().parse().ok()?;
        let month = caps.get(2)?.as_str().parse().ok()?;
        let day = caps
            .get(3)
            .map_or(Some(1), |d| d.as_str().parse().ok())?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

/// Oldest embedded date first; keys without a date go last. Ties by key.
pub fn sort_by_key_date(objects: &mut [ObjectSummary]) {
    objects.sort_by_cached_key(|object| {
        let date = key_date(&object.key);
        (date.is_none(), date, object.key.clone())
    });
}
