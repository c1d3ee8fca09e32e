pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use config::AppConfig;
pub use crate::core::{Orchestrator, Scheduler};
pub use domain::model::{CycleSummary, FileOutcome, FileRecord, FileStatus};
pub use utils::error::{EtlError, Result};
