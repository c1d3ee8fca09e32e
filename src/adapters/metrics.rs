use crate::domain::model::{BatchResult, CleanupSummary};
use crate::domain::ports::MetricsSink;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub files_started: u64,
    pub files_completed: u64,
    pub files_failed: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_persisted: u64,
    pub duplicates: u64,
    pub cleanups: u64,
    pub cleanups_skipped: u64,
    pub processing_skipped: u64,
}

/// Counts events in memory and mirrors each one to the log.
#[derive(Debug, Default)]
pub struct TracingMetrics {
    files_started: AtomicU64,
    files_completed: AtomicU64,
    files_failed: AtomicU64,
    records_processed: AtomicU64,
    records_failed: AtomicU64,
    records_persisted: AtomicU64,
    duplicates: AtomicU64,
    cleanups: AtomicU64,
    cleanups_skipped: AtomicU64,
    processing_skipped: AtomicU64,
}

impl TracingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_started: self.files_started.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            records_persisted: self.records_persisted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            cleanups_skipped: self.cleanups_skipped.load(Ordering::Relaxed),
            processing_skipped: self.processing_skipped.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            "📊 Files: {} started, {} completed, {} failed | Records: {} processed, {} failed, {} persisted, {} duplicates",
            s.files_started,
            s.files_completed,
            s.files_failed,
            s.records_processed,
            s.records_failed,
            s.records_persisted,
            s.duplicates
        );
    }
}

impl MetricsSink for TracingMetrics {
    fn file_started(&self, key: &str) {
        self.files_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!("🚀 Processing started: {}", key);
    }

    fn file_completed(&self, key: &str, processed: u64, failed: u64) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
        self.records_processed.fetch_add(processed, Ordering::Relaxed);
        self.records_failed.fetch_add(failed, Ordering::Relaxed);
        tracing::info!(
            "✅ Processing completed: {} ({} processed, {} failed)",
            key,
            processed,
            failed
        );
    }

    fn file_failed(&self, key: &str, reason: &str) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("❌ Processing failed: {}: {}", key, reason);
    }

    fn batch_processed(&self, key: &str, result: &BatchResult) {
        self.records_persisted
            .fetch_add(result.persisted, Ordering::Relaxed);
        self.duplicates
            .fetch_add(result.duplicates, Ordering::Relaxed);
        tracing::debug!(
            "Batch for {}: {} processed, {} valid, {} invalid, {} duplicates, {} persisted in {:?}",
            key,
            result.processed,
            result.valid,
            result.invalid,
            result.duplicates,
            result.persisted,
            result.elapsed
        );
    }

    fn cleanup_started(&self) {
        tracing::info!("🧹 Cleanup started");
    }

    fn cleanup_completed(&self, summary: &CleanupSummary) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "🧹 Cleanup completed: {} stuck records recovered, {} old records deleted",
            summary.recovered,
            summary.deleted
        );
    }

    fn cleanup_skipped(&self) {
        self.cleanups_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn processing_skipped(&self) {
        self.processing_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn file_started(&self, _key: &str) {}
    fn file_completed(&self, _key: &str, _processed: u64, _failed: u64) {}
    fn file_failed(&self, _key: &str, _reason: &str) {}
    fn batch_processed(&self, _key: &str, _result: &BatchResult) {}
    fn cleanup_started(&self) {}
    fn cleanup_completed(&self, _summary: &CleanupSummary) {}
    fn cleanup_skipped(&self) {}
    fn processing_skipped(&self) {}
}
