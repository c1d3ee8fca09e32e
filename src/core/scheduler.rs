//! Lock-guarded periodic triggers for processing and cleanup.
//!
//! Every firing does a non-blocking `try_lock`. When the lock is held
//! elsewhere the firing is skipped; that is a normal outcome, not an error.

use crate::core::ledger::{DEFAULT_RETENTION, DEFAULT_STUCK_TIMEOUT};
use crate::core::orchestrator::Orchestrator;
use crate::domain::model::{CleanupSummary, CycleSummary};
use crate::domain::ports::{LockRegistry, MetricsSink};
use crate::utils::error::{EtlError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const PROCESSING_LOCK: &str = "review-processing";
pub const CLEANUP_LOCK: &str = "review-cleanup";
/// Reserved for the liveness check; never used for real work.
pub const HEALTH_CHECK_LOCK: &str = "scheduler-health-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub processing_interval: Duration,
    pub cleanup_interval: Duration,
    pub stuck_timeout: Duration,
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            stuck_timeout: DEFAULT_STUCK_TIMEOUT,
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Processing,
    Cleanup,
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    locks: Arc<dyn LockRegistry>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        locks: Arc<dyn LockRegistry>,
        metrics: Arc<dyn MetricsSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            orchestrator,
            locks,
            metrics,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Runs `work` while holding `lock_name`. Returns `Ok(None)` without
    /// running anything when the lock is taken. The work runs in its own task
    /// so the lock is released even if it panics. Expiring locks are renewed
    /// for as long as the work runs.
    async fn with_lock<T, F, Fut>(&self, lock_name: &str, work: F) -> Result<Option<T>>
    where
        F: FnOnce(Arc<Orchestrator>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let lock = self.locks.obtain(lock_name);
        if !lock.try_lock().await? {
            return Ok(None);
        }

        let mut task = tokio::spawn(work(self.orchestrator.clone()));
        let joined = match lock.renew_every() {
            None => task.await,
            Some(every) => {
                let mut renew = tokio::time::interval(every.max(Duration::from_millis(1)));
                renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // interval fires immediately; the lease was just taken
                renew.tick().await;
                loop {
                    tokio::select! {
                        joined = &mut task => break joined,
                        _ = renew.tick() => match lock.extend().await {
                            Ok(true) => tracing::debug!("🔄 Renewed lock '{}'", lock_name),
                            Ok(false) => tracing::error!(
                                "❌ Lock '{}' was lost while work was still running",
                                lock_name
                            ),
                            Err(e) => tracing::warn!("Failed to renew lock '{}': {}", lock_name, e),
                        },
                    }
                }
            }
        };
        if let Err(e) = lock.unlock().await {
            tracing::error!("❌ Failed to release lock '{}': {}", lock_name, e);
        }

        match joined {
            Ok(result) => result.map(Some),
            Err(e) => Err(EtlError::processing(format!(
                "task holding '{}' aborted: {}",
                lock_name, e
            ))),
        }
    }

    /// One firing of the processing trigger. Errors are logged, never raised.
    pub async fn processing_tick(&self) -> Option<CycleSummary> {
        match self
            .with_lock(PROCESSING_LOCK, |orchestrator| async move {
                orchestrator.run_cycle().await
            })
            .await
        {
            Ok(Some(summary)) => Some(summary),
            Ok(None) => {
                tracing::info!("⏭️ Processing skipped: lock '{}' is held", PROCESSING_LOCK);
                self.metrics.processing_skipped();
                None
            }
            Err(e) => {
                tracing::error!(
                    "❌ Processing cycle failed: {} (Category: {:?}, Severity: {:?})",
                    e,
                    e.category(),
                    e.severity()
                );
                None
            }
        }
    }

    /// One firing of the cleanup trigger: stuck-job recovery, then retention.
    pub async fn cleanup_tick(&self) -> Option<CleanupSummary> {
        match self.run_cleanup().await {
            Ok(Some(summary)) => Some(summary),
            Ok(None) => {
                tracing::info!("⏭️ Cleanup skipped: lock '{}' is held", CLEANUP_LOCK);
                self.metrics.cleanup_skipped();
                None
            }
            Err(e) => {
                tracing::error!("❌ Cleanup failed: {}", e);
                None
            }
        }
    }

    async fn run_cleanup(&self) -> Result<Option<CleanupSummary>> {
        let stuck_timeout = self.config.stuck_timeout;
        let retention = self.config.retention;
        let metrics = self.metrics.clone();
        self.with_lock(CLEANUP_LOCK, move |orchestrator| async move {
            metrics.cleanup_started();
            let summary = orchestrator.cleanup(stuck_timeout, retention).await?;
            metrics.cleanup_completed(&summary);
            Ok(summary)
        })
        .await
    }

    /// Admin "process now". Unlike the periodic trigger, a held lock is
    /// reported to the caller.
    pub async fn trigger_now(&self) -> Result<CycleSummary> {
        self.with_lock(PROCESSING_LOCK, |orchestrator| async move {
            orchestrator.run_cycle().await
        })
        .await?
        .ok_or_else(|| EtlError::CycleLocked {
            lock: PROCESSING_LOCK.to_string(),
        })
    }

    pub async fn trigger_cleanup_now(&self) -> Result<CleanupSummary> {
        self.run_cleanup().await?.ok_or_else(|| EtlError::CycleLocked {
            lock: CLEANUP_LOCK.to_string(),
        })
    }

    /// Acquire-then-release on the reserved key. `Ok(false)` means the lock
    /// backend answered but the health check key was busy.
    pub async fn health_check(&self) -> Result<bool> {
        let lock = self.locks.obtain(HEALTH_CHECK_LOCK);
        if !lock.try_lock().await? {
            tracing::warn!("Health check lock '{}' is busy", HEALTH_CHECK_LOCK);
            return Ok(false);
        }
        lock.unlock().await?;
        Ok(true)
    }

    /// Starts both triggers on their own timers. The first firing of each
    /// happens immediately.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, stop) = watch::channel(false);
        tracing::info!(
            "⏱️ Scheduler started: processing every {:?}, cleanup every {:?}",
            self.config.processing_interval,
            self.config.cleanup_interval
        );
        let tasks = vec![
            tokio::spawn(self.clone().trigger_loop(
                Trigger::Processing,
                self.config.processing_interval,
                stop.clone(),
            )),
            tokio::spawn(self.clone().trigger_loop(
                Trigger::Cleanup,
                self.config.cleanup_interval,
                stop,
            )),
        ];
        SchedulerHandle { shutdown, tasks }
    }

    async fn trigger_loop(
        self: Arc<Self>,
        trigger: Trigger,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        tracing::debug!("{:?} trigger stopped", trigger);
                        break;
                    }
                }
                _ = interval.tick() => match trigger {
                    Trigger::Processing => {
                        self.processing_tick().await;
                    }
                    Trigger::Cleanup => {
                        self.cleanup_tick().await;
                    }
                },
            }
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops both timers and waits for any in-flight firing to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::LocalObjectStore;
    use crate::adapters::lock::{InProcessLockRegistry, SqliteLeaseLockRegistry};
    use crate::adapters::sqlite::SqliteRepository;
    use crate::core::batch::{BatchConfig, BatchProcessor};
    use crate::core::gateway::{ObjectStoreGateway, RetryPolicy};
    use crate::core::ledger::FileTracker;
    use crate::core::orchestrator::OrchestratorConfig;
    use crate::core::validator::ReviewValidator;
    use crate::domain::model::BatchResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMetrics {
        events: Mutex<Vec<String>>,
    }

    impl RecordingMetrics {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    impl MetricsSink for RecordingMetrics {
        fn file_started(&self, _key: &str) {
            self.push("file_started");
        }
        fn file_completed(&self, _key: &str, _processed: u64, _failed: u64) {
            self.push("file_completed");
        }
        fn file_failed(&self, _key: &str, _reason: &str) {
            self.push("file_failed");
        }
        fn batch_processed(&self, _key: &str, _result: &BatchResult) {
            self.push("batch_processed");
        }
        fn cleanup_started(&self) {
            self.push("cleanup_started");
        }
        fn cleanup_completed(&self, _summary: &CleanupSummary) {
            self.push("cleanup_completed");
        }
        fn cleanup_skipped(&self) {
            self.push("cleanup_skipped");
        }
        fn processing_skipped(&self) {
            self.push("processing_skipped");
        }
    }

    const LINE: &str = r#"{"hotelId": 10984, "platform": "Agoda", "hotelName": "Oscar Saigon Hotel", "comment": {"hotelReviewId": 948353737, "rating": 6.4, "reviewDate": "2024-04-10T05:37:00+07:00", "reviewComments": "Basic room."}}"#;

    fn write_review(dir: &std::path::Path, key: &str) {
        let path = dir.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("{}\n", LINE)).unwrap();
    }

    fn build_scheduler(
        dir: &std::path::Path,
        repository: Arc<SqliteRepository>,
        locks: Arc<dyn LockRegistry>,
        config: OrchestratorConfig,
    ) -> (Arc<Scheduler>, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::default());
        let orchestrator = Orchestrator::new(
            ObjectStoreGateway::new(Arc::new(LocalObjectStore::new(dir)), RetryPolicy::default()),
            FileTracker::new(repository.clone()),
            BatchProcessor::new(
                ReviewValidator::default(),
                repository.clone(),
                repository.clone(),
                BatchConfig::default(),
            ),
            repository,
            metrics.clone(),
            config,
        );
        let scheduler = Scheduler::new(
            Arc::new(orchestrator),
            locks,
            metrics.clone(),
            SchedulerConfig::default(),
        );
        (Arc::new(scheduler), metrics)
    }

    fn scheduler(dir: &std::path::Path) -> (Arc<Scheduler>, Arc<RecordingMetrics>, Arc<InProcessLockRegistry>) {
        write_review(dir, "reviews/2024-04-10/agoda.jl");
        let locks = Arc::new(InProcessLockRegistry::new());
        let (scheduler, metrics) = build_scheduler(
            dir,
            Arc::new(SqliteRepository::in_memory().unwrap()),
            locks.clone(),
            OrchestratorConfig::default(),
        );
        (scheduler, metrics, locks)
    }

    #[tokio::test]
    async fn test_held_lock_skips_without_processing() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, metrics, locks) = scheduler(dir.path());
        let held = locks.obtain(PROCESSING_LOCK);
        assert!(held.try_lock().await.unwrap());

        assert!(scheduler.processing_tick().await.is_none());
        assert_eq!(metrics.events(), vec!["processing_skipped"]);

        let err = scheduler.trigger_now().await.unwrap_err();
        assert!(matches!(err, EtlError::CycleLocked { .. }));
    }

    #[tokio::test]
    async fn test_tick_processes_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, metrics, locks) = scheduler(dir.path());

        let summary = scheduler.processing_tick().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(metrics.events().contains(&"file_completed".to_string()));

        // Released afterwards
        assert!(locks.obtain(PROCESSING_LOCK).try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_skip_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, metrics, locks) = scheduler(dir.path());

        let held = locks.obtain(CLEANUP_LOCK);
        held.try_lock().await.unwrap();
        assert!(scheduler.cleanup_tick().await.is_none());
        held.unlock().await.unwrap();

        let summary = scheduler.cleanup_tick().await.unwrap();
        assert_eq!(summary, CleanupSummary::default());
        assert_eq!(
            metrics.events(),
            vec!["cleanup_skipped", "cleanup_started", "cleanup_completed"]
        );
    }

    #[tokio::test]
    async fn test_health_check_releases_its_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _, locks) = scheduler(dir.path());

        assert!(scheduler.health_check().await.unwrap());
        // Released after the first check
        assert!(scheduler.health_check().await.unwrap());

        locks.obtain(HEALTH_CHECK_LOCK).try_lock().await.unwrap();
        assert!(!scheduler.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _, _) = scheduler(dir.path());

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        let done = scheduler
            .orchestrator()
            .list_statuses(None, 10)
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
    }
    #[tokio::test]
    async fn test_trigger_now_with_concurrent_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 10..=15 {
            write_review(dir.path(), &format!("reviews/2024-04-{}/agoda.jl", day));
        }
        let (scheduler, metrics) = build_scheduler(
            dir.path(),
            Arc::new(SqliteRepository::in_memory().unwrap()),
            Arc::new(InProcessLockRegistry::new()),
            OrchestratorConfig {
                max_concurrent_files: 4,
                ..OrchestratorConfig::default()
            },
        );

        let summary = scheduler.trigger_now().await.unwrap();
        assert_eq!(summary.candidates, 6);
        assert_eq!(summary.completed, 6);
        let completed = metrics
            .events()
            .into_iter()
            .filter(|e| e == "file_completed")
            .count();
        assert_eq!(completed, 6);
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_work_runs() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(SqliteRepository::in_memory().unwrap());
        let lease = Duration::from_millis(300);
        let (scheduler, _) = build_scheduler(
            dir.path(),
            repository.clone(),
            Arc::new(SqliteLeaseLockRegistry::new(repository.clone(), lease)),
            OrchestratorConfig::default(),
        );
        let other = SqliteLeaseLockRegistry::new(repository, lease).obtain(PROCESSING_LOCK);

        let work = scheduler.with_lock(PROCESSING_LOCK, |_| async {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            Ok(())
        });
        let contender = async {
            // Well past the lease; only renewal keeps the other worker out
            tokio::time::sleep(Duration::from_millis(700)).await;
            other.try_lock().await.unwrap()
        };
        let (finished, stolen) = tokio::join!(work, contender);

        assert_eq!(finished.unwrap(), Some(()));
        assert!(!stolen);
        // Released at the end
        assert!(other.try_lock().await.unwrap());
    }
}
