use crate::config::toml_config::DEFAULT_CONFIG_PATH;
use crate::domain::model::FileStatus;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "review-etl")]
#[command(about = "Ingests hotel review JSON Lines files from object storage into a review database")]
pub struct Cli {
    /// Path to TOML configuration file (optional; defaults apply when missing)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the processing and cleanup triggers until Ctrl-C
    Run,
    /// Process pending files once, now
    Process,
    /// Recover stuck files and purge old ledger rows once, now
    Cleanup,
    /// Show one ledger row
    Status { id: i64 },
    /// List ledger rows, newest first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<FileStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Re-process a FAILED or CANCELLED file as a new attempt
    Retry { id: i64 },
    /// Cancel a PENDING or IN_PROGRESS file
    Stop { id: i64 },
    /// Per-provider review statistics
    Stats,
    /// Check that the lock backend answers
    Health,
}

fn parse_status(value: &str) -> Result<FileStatus, String> {
    value
        .replace('-', "_")
        .parse()
        .map_err(|e: crate::utils::error::EtlError| e.to_string())
}
