use crate::core::batch::BatchConfig;
use crate::core::gateway::RetryPolicy;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::scheduler::SchedulerConfig;
use crate::core::validator::{ValidationRules, DEFAULT_KNOWN_PROVIDERS};
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{
    validate_aws_region, validate_non_empty_string, validate_path, validate_positive_number,
    validate_range, validate_required_field, validate_s3_bucket_name, validate_url, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "review-etl.toml";
pub const BUCKET_ENV: &str = "REVIEW_ETL_BUCKET";
pub const DATABASE_ENV: &str = "REVIEW_ETL_DATABASE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Local,
    Database,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub processing: ProcessingConfig,
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: Option<String>,
    pub prefix: String,
    pub region: String,
    /// S3-compatible endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub local_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: None,
            prefix: "reviews/".to_string(),
            region: "ap-southeast-1".to_string(),
            endpoint: None,
            force_path_style: false,
            local_root: "./data/objects".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/review-etl.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub error_threshold: u64,
    pub max_errors_per_batch: usize,
    pub persist_chunk_size: usize,
    pub large_batch_threshold: usize,
    pub large_batch_chunk_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_concurrent_files: usize,
    pub prioritize_by_key_date: bool,
    pub known_providers: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            error_threshold: 50,
            max_errors_per_batch: 50,
            persist_chunk_size: 100,
            large_batch_threshold: 10_000,
            large_batch_chunk_size: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            max_concurrent_files: 1,
            prioritize_by_key_date: true,
            known_providers: DEFAULT_KNOWN_PROVIDERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub processing_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub stuck_timeout_secs: u64,
    pub retention_days: u64,
    pub lock_backend: LockBackend,
    pub lock_lease_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            processing_interval_secs: 300,
            cleanup_interval_secs: 86_400,
            stuck_timeout_secs: 7_200,
            retention_days: 30,
            lock_backend: LockBackend::default(),
            lock_lease_secs: 600,
        }
    }
}

impl AppConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content);
        Ok(toml::from_str(&processed)?)
    }

    /// Loads `path` if it exists (defaults otherwise), then applies the
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            tracing::debug!("Loading configuration from {}", path.display());
            Self::from_file(path)?
        } else {
            tracing::debug!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(bucket) = std::env::var(BUCKET_ENV) {
            self.storage.bucket = Some(bucket);
        }
        if let Ok(path) = std::env::var(DATABASE_ENV) {
            self.database.path = path;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.processing.max_retries,
            base_delay: Duration::from_millis(self.processing.retry_base_delay_ms),
        }
    }

    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            known_providers: self.processing.known_providers.clone(),
            ..ValidationRules::default()
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_errors: self.processing.max_errors_per_batch,
            persist_chunk_size: self.processing.persist_chunk_size,
            large_batch_threshold: self.processing.large_batch_threshold,
            large_batch_chunk_size: self.processing.large_batch_chunk_size,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            prefix: self.storage.prefix.clone(),
            batch_size: self.processing.batch_size,
            error_threshold: self.processing.error_threshold,
            max_concurrent_files: self.processing.max_concurrent_files,
            prioritize_by_key_date: self.processing.prioritize_by_key_date,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let section = &self.scheduler;
        SchedulerConfig {
            processing_interval: Duration::from_secs(section.processing_interval_secs),
            cleanup_interval: Duration::from_secs(section.cleanup_interval_secs),
            stuck_timeout: Duration::from_secs(section.stuck_timeout_secs),
            retention: Duration::from_secs(section.retention_days * 24 * 60 * 60),
        }
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.scheduler.lock_lease_secs)
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        let storage = &self.storage;
        match storage.backend {
            StorageBackend::S3 => {
                let bucket = validate_required_field("storage.bucket", &storage.bucket)?;
                validate_s3_bucket_name("storage.bucket", bucket)?;
                validate_aws_region("storage.region", &storage.region)?;
                if let Some(endpoint) = &storage.endpoint {
                    validate_url("storage.endpoint", endpoint)?;
                }
            }
            StorageBackend::Local => validate_path("storage.local_root", &storage.local_root)?,
        }
        validate_path("database.path", &self.database.path)?;

        let processing = &self.processing;
        validate_positive_number("processing.batch_size", processing.batch_size, 1)?;
        validate_positive_number("processing.persist_chunk_size", processing.persist_chunk_size, 1)?;
        validate_positive_number(
            "processing.large_batch_chunk_size",
            processing.large_batch_chunk_size,
            1,
        )?;
        validate_positive_number(
            "processing.max_concurrent_files",
            processing.max_concurrent_files,
            1,
        )?;
        validate_range("processing.max_retries", processing.max_retries, 0, 10)?;
        validate_range(
            "processing.retry_base_delay_ms",
            processing.retry_base_delay_ms,
            0,
            60_000,
        )?;
        if processing.known_providers.is_empty() {
            return Err(EtlError::ConfigValidationError {
                field: "processing.known_providers".to_string(),
                message: "at least one provider must be accepted".to_string(),
            });
        }
        for provider in &processing.known_providers {
            validate_non_empty_string("processing.known_providers", provider)?;
        }

        let scheduler = &self.scheduler;
        validate_range(
            "scheduler.processing_interval_secs",
            scheduler.processing_interval_secs,
            1,
            u64::MAX,
        )?;
        validate_range(
            "scheduler.cleanup_interval_secs",
            scheduler.cleanup_interval_secs,
            1,
            u64::MAX,
        )?;
        validate_range("scheduler.stuck_timeout_secs", scheduler.stuck_timeout_secs, 60, u64::MAX)?;
        validate_range("scheduler.retention_days", scheduler.retention_days, 1, 3_650)?;
        if scheduler.lock_backend == LockBackend::Database {
            validate_range("scheduler.lock_lease_secs", scheduler.lock_lease_secs, 60, u64::MAX)?;
        }
        Ok(())
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

/// 替換環境變數 (例如 ${REVIEW_BUCKET})，未設定的變數保持原樣
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}]+)\}").ok())
        .as_ref()
    else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    })
    .into_owned()
}
