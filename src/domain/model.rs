use crate::utils::error::EtlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 檔案處理狀態機
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl FileStatus {
    pub const TERMINAL: [FileStatus; 4] = [
        FileStatus::Completed,
        FileStatus::Failed,
        FileStatus::Skipped,
        FileStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(EtlError::processing(format!("unknown file status: {}", other))),
        }
    }
}

/// One listed object in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// Storage-level version marker (S3 ETag without quotes).
    pub fingerprint: String,
}

/// Metadata captured on the ledger row at claim time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMetadata {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub provider: Option<String>,
}

impl FileMetadata {
    /// Provider is inferred from the file stem, e.g. `reviews/2025-04-10/agoda.jl` -> `agoda`.
    pub fn from_summary(summary: &ObjectSummary) -> Self {
        let provider = summary
            .key
            .rsplit('/')
            .next()
            .and_then(|name| name.split('.').next())
            .filter(|stem| !stem.is_empty())
            .map(str::to_string);

        Self {
            size: summary.size,
            last_modified: summary.last_modified,
            provider,
        }
    }
}

/// Ledger entry: one attempt to process one version of one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub source_key: String,
    pub content_fingerprint: String,
    pub attempt: u32,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub status: FileStatus,
    pub records_processed: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
}

/// One decoded line of a source file. Only lives for the batch it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub hotel_id: Option<i64>,
    pub platform: Option<String>,
    pub hotel_name: Option<String>,
    /// Nested review payload (`comment` object in the provider feed).
    pub comment: Option<serde_json::Value>,
    /// 1-based line number in the source file.
    pub line_number: usize,
    pub raw_line: String,
}

impl RawRecord {
    pub fn comment_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.comment.as_ref().and_then(|c| c.get(name))
    }

    pub fn comment_str(&self, name: &str) -> Option<&str> {
        self.comment_field(name).and_then(|v| v.as_str())
    }

    pub fn external_review_id(&self) -> Option<i64> {
        self.comment_field("hotelReviewId").and_then(json_i64)
    }

    pub fn rating(&self) -> Option<f64> {
        self.comment_field("rating").and_then(json_f64)
    }

    /// Raw date string as supplied, before any parsing.
    pub fn raw_review_date(&self) -> Option<&str> {
        self.comment_str("reviewDate")
            .or_else(|| self.comment_str("formattedReviewDate"))
    }

    pub fn reviewer_info(&self) -> Option<&serde_json::Value> {
        self.comment_field("reviewerInfo").filter(|v| v.is_object())
    }
}

/// Numbers sometimes arrive quoted in provider feeds.
pub(crate) fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.errors.push(violation.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewerInfo {
    pub country_name: Option<String>,
    pub display_member_name: Option<String>,
    pub review_group_name: Option<String>,
    pub room_type_name: Option<String>,
    pub length_of_stay: Option<i64>,
    pub reviewed_count: Option<i64>,
    pub is_expert: bool,
}

/// Persisted review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReview {
    pub hotel_id: i64,
    pub hotel_name: String,
    pub provider_id: i64,
    pub external_review_id: i64,
    pub rating: f64,
    pub review_title: Option<String>,
    pub review_comments: Option<String>,
    pub review_positives: Option<String>,
    pub review_negatives: Option<String>,
    pub review_date: Option<DateTime<Utc>>,
    pub raw_review_date: Option<String>,
    pub reviewer: Option<ReviewerInfo>,
    pub helpful_votes: Option<i64>,
    pub is_verified: bool,
    pub language: Option<String>,
    pub content_hash: String,
    pub source_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Provider {
    pub id: i64,
    pub code: String,
    pub name: String,
}

impl Provider {
    /// `Booking.com` -> `booking-com`
    pub fn code_for(name: &str) -> String {
        let mut code = String::with_capacity(name.len());
        for c in name.trim().chars() {
            if c.is_ascii_alphanumeric() {
                code.push(c.to_ascii_lowercase());
            } else if !code.ends_with('-') && !code.is_empty() {
                code.push('-');
            }
        }
        code.trim_end_matches('-').to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Failed,
}

/// Aggregate of one processing chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub processed: u64,
    pub valid: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub persisted: u64,
    pub errors: Vec<String>,
    pub elapsed: Duration,
    pub status: BatchStatus,
    pub persistence_error: Option<String>,
    /// Processing stopped at the record that used up the error budget;
    /// nothing after it was validated or persisted.
    pub budget_exhausted: bool,
}

impl Default for BatchResult {
    fn default() -> Self {
        Self {
            processed: 0,
            valid: 0,
            invalid: 0,
            duplicates: 0,
            persisted: 0,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
            status: BatchStatus::Completed,
            persistence_error: None,
            budget_exhausted: false,
        }
    }
}

impl BatchResult {
    pub fn record_error(&mut self, message: String, cap: usize) {
        if self.errors.len() < cap {
            self.errors.push(message);
        }
    }

    /// Sums `other` into `self`; errors stay capped at `cap`.
    pub fn merge(&mut self, other: BatchResult, cap: usize) {
        self.processed += other.processed;
        self.valid += other.valid;
        self.invalid += other.invalid;
        self.duplicates += other.duplicates;
        self.persisted += other.persisted;
        self.elapsed += other.elapsed;
        for error in other.errors {
            self.record_error(error, cap);
        }
        if self.persistence_error.is_none() {
            self.persistence_error = other.persistence_error;
        }
        self.budget_exhausted |= other.budget_exhausted;
        self.finalize_status();
    }

    pub fn finalize_status(&mut self) {
        self.status = if self.invalid > 0 || self.persistence_error.is_some() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
    }

    pub fn is_fatal(&self) -> bool {
        self.persistence_error.is_some()
    }
}

/// Terminal result of processing one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub record_id: i64,
    pub source_key: String,
    pub status: FileStatus,
    pub records_processed: u64,
    pub records_failed: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub candidates: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub recovered: usize,
    pub deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatistics {
    pub provider_code: String,
    pub provider_name: String,
    pub review_count: u64,
    pub average_rating: Option<f64>,
    pub latest_review_date: Option<DateTime<Utc>>,
}
