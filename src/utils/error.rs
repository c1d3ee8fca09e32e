use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Access denied to object: {key}")]
    AccessDenied { key: String },

    #[error("Transient network error for {key}: {message}")]
    TransientNetwork { key: String, message: String },

    #[error("Object store error: {message}")]
    Storage { message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("File record not found: {id}")]
    RecordNotFound { id: i64 },

    #[error("Illegal transition for file record {id}: {from} -> {to}")]
    IllegalTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("File record {id} is already being processed")]
    AlreadyRunning { id: i64 },

    #[error("Processing cycle already running (lock '{lock}' is held)")]
    CycleLocked { lock: String },

    #[error("Lock error: {message}")]
    LockError { message: String },

    #[error("Transform failed at line {line}: {message}")]
    TransformError { line: usize, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid configuration value for {field} ('{value}'): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ObjectStore,
    Persistence,
    Ledger,
    Configuration,
    Processing,
    Scheduling,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::ProcessingError {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. }
            | Self::AccessDenied { .. }
            | Self::TransientNetwork { .. }
            | Self::Storage { .. } => ErrorCategory::ObjectStore,
            Self::Database(_) | Self::Persistence { .. } => ErrorCategory::Persistence,
            Self::RecordNotFound { .. }
            | Self::IllegalTransition { .. }
            | Self::AlreadyRunning { .. } => ErrorCategory::Ledger,
            Self::CycleLocked { .. } | Self::LockError { .. } => ErrorCategory::Scheduling,
            Self::ConfigError { .. }
            | Self::TomlError(_)
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. }
            | Self::ConfigValidationError { .. } => ErrorCategory::Configuration,
            Self::TransformError { .. }
            | Self::SerializationError(_)
            | Self::ProcessingError { .. } => ErrorCategory::Processing,
            Self::IoError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CycleLocked { .. } | Self::AlreadyRunning { .. } => ErrorSeverity::Low,
            Self::TransientNetwork { .. } | Self::LockError { .. } => ErrorSeverity::Medium,
            Self::Database(_) | Self::IoError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    /// 只有網路類的暫時性錯誤值得重試
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::ObjectStore => match self {
                Self::NotFound { .. } => "Check that the object key still exists in the bucket",
                Self::AccessDenied { .. } => {
                    "Check the credentials and bucket policy used by the worker"
                }
                _ => "Check network connectivity to the object store and retry",
            },
            ErrorCategory::Persistence => {
                "Check that the database file is writable and not locked by another process"
            }
            ErrorCategory::Ledger => "Inspect the file record with the `status` command",
            ErrorCategory::Configuration => "Fix the configuration file or command line flags",
            ErrorCategory::Processing => "Inspect the source file for malformed content",
            ErrorCategory::Scheduling => "Another worker holds the lock; try again later",
            ErrorCategory::System => "Check disk space and file permissions",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::CycleLocked { .. } => {
                "A processing cycle is already running on another worker".to_string()
            }
            Self::NotFound { key } => format!("The file '{}' no longer exists", key),
            Self::InvalidConfigValueError { field, reason, .. } => {
                format!("Invalid setting '{}': {}", field, reason)
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        let transient = EtlError::TransientNetwork {
            key: "a.jl".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!EtlError::NotFound {
            key: "a.jl".to_string()
        }
        .is_retryable());
        assert!(!EtlError::AccessDenied {
            key: "a.jl".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_lock_contention_is_low_severity() {
        let err = EtlError::CycleLocked {
            lock: "review-processing".to_string(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Low);
        assert_eq!(err.category(), ErrorCategory::Scheduling);
    }

    #[test]
    fn test_illegal_transition_names_record() {
        let err = EtlError::IllegalTransition {
            id: 42,
            from: "COMPLETED".to_string(),
            to: "IN_PROGRESS".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("COMPLETED -> IN_PROGRESS"));
    }
}
