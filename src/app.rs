//! Composition root: turns an [`AppConfig`] into a wired [`Scheduler`].

use crate::adapters::local::LocalObjectStore;
use crate::adapters::lock::{InProcessLockRegistry, SqliteLeaseLockRegistry};
use crate::adapters::metrics::TracingMetrics;
use crate::adapters::sqlite::SqliteRepository;
use crate::config::{AppConfig, LockBackend, StorageBackend};
use crate::core::batch::BatchProcessor;
use crate::core::gateway::ObjectStoreGateway;
use crate::core::ledger::FileTracker;
use crate::core::orchestrator::Orchestrator;
use crate::core::scheduler::Scheduler;
use crate::core::validator::ReviewValidator;
use crate::domain::ports::{LockRegistry, ObjectStore};
use crate::utils::error::{EtlError, Result};
use std::sync::Arc;

pub struct App {
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<TracingMetrics>,
    pub repository: Arc<SqliteRepository>,
}

impl App {
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        self.scheduler.orchestrator()
    }
}

pub async fn build(config: &AppConfig) -> Result<App> {
    let repository = Arc::new(SqliteRepository::open(&config.database_path())?);
    let store = object_store(config).await?;
    assemble(config, store, repository)
}

/// Wires the core around an already constructed store and database.
pub fn assemble(
    config: &AppConfig,
    store: Arc<dyn ObjectStore>,
    repository: Arc<SqliteRepository>,
) -> Result<App> {
    let metrics = Arc::new(TracingMetrics::new());
    let locks: Arc<dyn LockRegistry> = match config.scheduler.lock_backend {
        LockBackend::Local => Arc::new(InProcessLockRegistry::new()),
        LockBackend::Database => {
            let registry = SqliteLeaseLockRegistry::new(repository.clone(), config.lock_lease());
            tracing::info!("🔐 Using database leases as '{}'", registry.owner());
            Arc::new(registry)
        }
    };

    let processor = BatchProcessor::new(
        ReviewValidator::new(config.validation_rules()),
        repository.clone(),
        repository.clone(),
        config.batch_config(),
    );
    let orchestrator = Orchestrator::new(
        ObjectStoreGateway::new(store, config.retry_policy()),
        FileTracker::new(repository.clone()),
        processor,
        repository.clone(),
        metrics.clone(),
        config.orchestrator_config(),
    );
    let scheduler = Scheduler::new(
        Arc::new(orchestrator),
        locks,
        metrics.clone(),
        config.scheduler_config(),
    );

    Ok(App {
        scheduler: Arc::new(scheduler),
        metrics,
        repository,
    })
}

async fn object_store(config: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Local => {
            tracing::info!("📁 Reading review files from {}", storage.local_root);
            Ok(Arc::new(LocalObjectStore::new(&storage.local_root)))
        }
        #[cfg(feature = "s3")]
        StorageBackend::S3 => {
            let bucket = storage
                .bucket
                .as_deref()
                .ok_or_else(|| EtlError::MissingConfigError {
                    field: "storage.bucket".to_string(),
                })?;
            tracing::info!("☁️ Reading review files from s3://{}/{}", bucket, storage.prefix);
            let store = crate::adapters::s3::S3ObjectStore::connect(
                bucket,
                &storage.region,
                storage.endpoint.as_deref(),
                storage.force_path_style,
            )
            .await;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 => Err(EtlError::config(
            "storage.backend = \"s3\" needs the `s3` feature",
        )),
    }
}
