//! SQLite-backed repositories for the ledger, providers and reviews.
//!
//! Uses a single `Mutex<Connection>`. Uniqueness and state-machine legality
//! are enforced in SQL (unique constraints, conditional updates), so several
//! processes sharing one database file stay consistent.

use crate::domain::model::{
    CanonicalReview, FileMetadata, FileRecord, FileStatus, Provider, ProviderStatistics,
};
use crate::domain::ports::{
    FileRecordRepository, ProviderRepository, ReviewRepository, TransitionUpdate,
};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Fixed-width UTC timestamps so that string comparison orders them correctly.
const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS file_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_key TEXT NOT NULL,
    content_fingerprint TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 1,
    size INTEGER NOT NULL DEFAULT 0,
    last_modified TEXT,
    status TEXT NOT NULL,
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    provider TEXT,
    created_at TEXT NOT NULL,
    processing_started_at TEXT,
    processing_completed_at TEXT,
    UNIQUE (source_key, content_fingerprint, attempt)
);

CREATE INDEX IF NOT EXISTS idx_file_records_status ON file_records (status, processing_started_at);

CREATE TABLE IF NOT EXISTS providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_id INTEGER NOT NULL REFERENCES providers(id),
    external_review_id INTEGER NOT NULL,
    hotel_id INTEGER NOT NULL,
    hotel_name TEXT NOT NULL,
    rating REAL NOT NULL,
    review_title TEXT,
    review_comments TEXT,
    review_positives TEXT,
    review_negatives TEXT,
    review_date TEXT,
    raw_review_date TEXT,
    reviewer_json TEXT,
    helpful_votes INTEGER,
    is_verified INTEGER NOT NULL DEFAULT 0,
    language TEXT,
    content_hash TEXT NOT NULL,
    source_line INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (provider_id, external_review_id)
);

CREATE INDEX IF NOT EXISTS idx_reviews_content_hash ON reviews (content_hash);

CREATE TABLE IF NOT EXISTS scheduler_locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

const FILE_COLUMNS: &str = "id, source_key, content_fingerprint, attempt, size, last_modified, \
     status, records_processed, records_failed, error_message, provider, created_at, \
     processing_started_at, processing_completed_at";

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FMT).to_string()
}

fn parse_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn file_record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<FileStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let created_at = parse_ts(11, Some(row.get(11)?))?.unwrap_or_else(Utc::now);

    Ok(FileRecord {
        id: row.get(0)?,
        source_key: row.get(1)?,
        content_fingerprint: row.get(2)?,
        attempt: row.get::<_, i64>(3)? as u32,
        size: row.get::<_, i64>(4)? as u64,
        last_modified: parse_ts(5, row.get(5)?)?,
        status,
        records_processed: row.get::<_, i64>(7)? as u64,
        records_failed: row.get::<_, i64>(8)? as u64,
        error_message: row.get(9)?,
        provider: row.get(10)?,
        created_at,
        processing_started_at: parse_ts(12, row.get(12)?)?,
        processing_completed_at: parse_ts(13, row.get(13)?)?,
    })
}

/// `'PENDING', 'IN_PROGRESS'` style list for `status IN (...)`.
fn status_list(statuses: &[FileStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Opens (or creates) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EtlError::persistence("database connection mutex poisoned"))
    }

    fn latest_attempt(
        conn: &Connection,
        source_key: &str,
        fingerprint: &str,
    ) -> Result<Option<FileRecord>> {
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM file_records \
                     WHERE source_key = ?1 AND content_fingerprint = ?2 \
                     ORDER BY attempt DESC LIMIT 1",
                    FILE_COLUMNS
                ),
                params![source_key, fingerprint],
                file_record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn record_by_id(conn: &Connection, id: i64) -> Result<Option<FileRecord>> {
        let record = conn
            .query_row(
                &format!("SELECT {} FROM file_records WHERE id = ?1", FILE_COLUMNS),
                [id],
                file_record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Takes (or renews) the lease `name` for `owner` when it is free, expired
    /// or already held by the same owner.
    pub fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| EtlError::LockError {
            message: format!("invalid lease duration: {}", e),
        })?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT INTO scheduler_locks (name, owner, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at \
             WHERE scheduler_locks.owner = excluded.owner OR scheduler_locks.expires_at < ?4",
            params![name, owner, format_ts(now + ttl), format_ts(now)],
        )?;
        Ok(changed == 1)
    }

    /// Drops the lease only when `owner` still holds it.
    pub fn release_lease(&self, name: &str, owner: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "DELETE FROM scheduler_locks WHERE name = ?1 AND owner = ?2",
            params![name, owner],
        )?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl FileRecordRepository for SqliteRepository {
    async fn insert_if_absent(
        &self,
        source_key: &str,
        fingerprint: &str,
        metadata: &FileMetadata,
    ) -> Result<FileRecord> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT INTO file_records \
             (source_key, content_fingerprint, attempt, size, last_modified, status, provider, created_at) \
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(source_key, content_fingerprint, attempt) DO NOTHING",
            params![
                source_key,
                fingerprint,
                metadata.size as i64,
                metadata.last_modified.map(format_ts),
                FileStatus::Pending.as_str(),
                metadata.provider,
                format_ts(Utc::now()),
            ],
        )?;
        if inserted == 1 {
            tracing::debug!("Inserted ledger row for {} ({})", source_key, fingerprint);
        }

        Self::latest_attempt(&conn, source_key, fingerprint)?.ok_or_else(|| {
            EtlError::persistence(format!(
                "ledger row for {} ({}) vanished after insert",
                source_key, fingerprint
            ))
        })
    }

    async fn insert_retry_attempt(&self, previous: &FileRecord) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO file_records \
                 (source_key, content_fingerprint, attempt, size, last_modified, status, provider, created_at) \
                 SELECT source_key, content_fingerprint, MAX(attempt) + 1, ?3, ?4, ?5, ?6, ?7 \
                 FROM file_records WHERE source_key = ?1 AND content_fingerprint = ?2 \
                 GROUP BY source_key, content_fingerprint \
                 HAVING SUM(CASE WHEN status IN ({}) THEN 1 ELSE 0 END) = 0 \
                 ON CONFLICT DO NOTHING",
                status_list(&[FileStatus::Pending, FileStatus::InProgress])
            ),
            params![
                previous.source_key,
                previous.content_fingerprint,
                previous.size as i64,
                previous.last_modified.map(format_ts),
                FileStatus::Pending.as_str(),
                previous.provider,
                format_ts(Utc::now()),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Self::record_by_id(&conn, conn.last_insert_rowid())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn()?;
        Self::record_by_id(&conn, id)
    }

    async fn find_by_key_and_fingerprint(
        &self,
        source_key: &str,
        fingerprint: &str,
    ) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn()?;
        Self::latest_attempt(&conn, source_key, fingerprint)
    }

    async fn exists_by_key_and_fingerprint(
        &self,
        source_key: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM file_records \
             WHERE source_key = ?1 AND content_fingerprint = ?2)",
            params![source_key, fingerprint],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    async fn find_by_status(
        &self,
        status: Option<FileStatus>,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_records WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY id DESC LIMIT ?2",
            FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            file_record_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<FileRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_records \
             WHERE status = ?1 AND processing_started_at < ?2 \
             ORDER BY processing_started_at",
            FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![FileStatus::InProgress.as_str(), format_ts(started_before)],
            file_record_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn transition(
        &self,
        id: i64,
        from: &[FileStatus],
        to: FileStatus,
        update: TransitionUpdate,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let (processed, failed) = match update.counts {
            Some((processed, failed)) => (Some(processed as i64), Some(failed as i64)),
            None => (None, None),
        };

        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE file_records SET status = ?1, \
                 processing_started_at = COALESCE(?2, processing_started_at), \
                 processing_completed_at = COALESCE(?3, processing_completed_at), \
                 error_message = COALESCE(?4, error_message), \
                 records_processed = COALESCE(?5, records_processed), \
                 records_failed = COALESCE(?6, records_failed) \
                 WHERE id = ?7 AND status IN ({})",
                status_list(from)
            ),
            params![
                to.as_str(),
                update.started_at.map(format_ts),
                update.completed_at.map(format_ts),
                update.error_message,
                processed,
                failed,
                id,
            ],
        )?;
        Ok(changed == 1)
    }

    async fn update_progress(&self, id: i64, processed: u64, failed: u64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE file_records SET records_processed = ?1, records_failed = ?2 \
             WHERE id = ?3 AND status = ?4",
            params![
                processed as i64,
                failed as i64,
                id,
                FileStatus::InProgress.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM file_records WHERE status IN ({}) AND created_at < ?1",
                status_list(&FileStatus::TERMINAL)
            ),
            [format_ts(cutoff)],
        )?;
        Ok(deleted as u64)
    }
}

#[async_trait]
impl ProviderRepository for SqliteRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<Provider>> {
        let conn = self.lock_conn()?;
        let provider = conn
            .query_row(
                "SELECT id, code, name FROM providers WHERE code = ?1",
                [code],
                |row| {
                    Ok(Provider {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(provider)
    }

    async fn insert_or_get(&self, code: &str, name: &str) -> Result<Provider> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO providers (code, name, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(code) DO NOTHING",
            params![code, name, format_ts(Utc::now())],
        )?;
        let provider = conn.query_row(
            "SELECT id, code, name FROM providers WHERE code = ?1",
            [code],
            |row| {
                Ok(Provider {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )?;
        Ok(provider)
    }
}

#[async_trait]
impl ReviewRepository for SqliteRepository {
    async fn exists_by_external_id(
        &self,
        provider_id: i64,
        external_review_id: i64,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM reviews WHERE provider_id = ?1 AND external_review_id = ?2)",
            params![provider_id, external_review_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    async fn insert_batch(&self, reviews: &[CanonicalReview]) -> Result<u64> {
        if reviews.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO reviews (provider_id, external_review_id, hotel_id, hotel_name, rating, \
                 review_title, review_comments, review_positives, review_negatives, review_date, \
                 raw_review_date, reviewer_json, helpful_votes, is_verified, language, content_hash, \
                 source_line, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
                 ON CONFLICT(provider_id, external_review_id) DO NOTHING",
            )?;
            let created_at = format_ts(Utc::now());
            for review in reviews {
                let reviewer_json = review
                    .reviewer
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                inserted += stmt.execute(params![
                    review.provider_id,
                    review.external_review_id,
                    review.hotel_id,
                    review.hotel_name,
                    review.rating,
                    review.review_title,
                    review.review_comments,
                    review.review_positives,
                    review.review_negatives,
                    review.review_date.map(format_ts),
                    review.raw_review_date,
                    reviewer_json,
                    review.helpful_votes,
                    review.is_verified,
                    review.language,
                    review.content_hash,
                    review.source_line as i64,
                    created_at,
                ])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn provider_statistics(&self) -> Result<Vec<ProviderStatistics>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.code, p.name, COUNT(r.id), AVG(r.rating), MAX(r.review_date) \
             FROM providers p LEFT JOIN reviews r ON r.provider_id = p.id \
             GROUP BY p.id, p.code, p.name ORDER BY p.code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProviderStatistics {
                provider_code: row.get(0)?,
                provider_name: row.get(1)?,
                review_count: row.get::<_, i64>(2)? as u64,
                average_rating: row.get(3)?,
                latest_review_date: parse_ts(4, row.get(4)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metadata() -> FileMetadata {
        FileMetadata {
            size: 512,
            last_modified: Some(Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()),
            provider: Some("a".to_string()),
        }
    }

    fn review(provider_id: i64, external_id: i64) -> CanonicalReview {
        CanonicalReview {
            hotel_id: 10984,
            hotel_name: "Oscar Saigon Hotel".to_string(),
            provider_id,
            external_review_id: external_id,
            rating: 6.4,
            review_title: None,
            review_comments: Some("Hotel room is basic".to_string()),
            review_positives: None,
            review_negatives: None,
            review_date: Some(Utc.with_ymd_and_hms(2025, 4, 9, 22, 37, 0).unwrap()),
            raw_review_date: Some("2025-04-10T05:37:00+07:00".to_string()),
            reviewer: None,
            helpful_votes: None,
            is_verified: false,
            language: Some("en".to_string()),
            content_hash: format!("hash-{}", external_id),
            source_line: 1,
        }
    }

    #[tokio::test]
    async fn test_claim_twice_returns_same_row() {
        let repo = SqliteRepository::in_memory().unwrap();

        let first = repo
            .insert_if_absent("reviews/2024/01/a.jl", "etagX", &metadata())
            .await
            .unwrap();
        let second = repo
            .insert_if_absent("reviews/2024/01/a.jl", "etagX", &metadata())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, FileStatus::Pending);
        assert_eq!(first.attempt, 1);
        assert_eq!(first.size, 512);
        assert!(repo
            .exists_by_key_and_fingerprint("reviews/2024/01/a.jl", "etagX")
            .await
            .unwrap());
        assert!(!repo
            .exists_by_key_and_fingerprint("reviews/2024/01/a.jl", "etagY")
            .await
            .unwrap());
        assert_eq!(repo.find_by_status(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let repo = SqliteRepository::in_memory().unwrap();
        let record = repo.insert_if_absent("a.jl", "e1", &metadata()).await.unwrap();
        let started = TransitionUpdate {
            started_at: Some(Utc::now()),
            ..TransitionUpdate::default()
        };

        assert!(repo
            .transition(record.id, &[FileStatus::Pending], FileStatus::InProgress, started.clone())
            .await
            .unwrap());
        // The second worker loses the race.
        assert!(!repo
            .transition(record.id, &[FileStatus::Pending], FileStatus::InProgress, started)
            .await
            .unwrap());

        assert!(repo.update_progress(record.id, 10, 1).await.unwrap());
        let done = TransitionUpdate {
            completed_at: Some(Utc::now()),
            counts: Some((20, 0)),
            ..TransitionUpdate::default()
        };
        assert!(repo
            .transition(record.id, &[FileStatus::InProgress], FileStatus::Completed, done)
            .await
            .unwrap());

        let stored = repo.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Completed);
        assert_eq!(stored.records_processed, 20);
        assert!(stored.processing_started_at.is_some());
        assert!(stored.processing_completed_at.is_some());
        assert!(!repo.update_progress(record.id, 1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_attempt_requires_terminal_pair() {
        let repo = SqliteRepository::in_memory().unwrap();
        let record = repo.insert_if_absent("a.jl", "e1", &metadata()).await.unwrap();

        assert!(repo.insert_retry_attempt(&record).await.unwrap().is_none());

        repo.transition(
            record.id,
            &[FileStatus::Pending],
            FileStatus::Failed,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();
        let retry = repo.insert_retry_attempt(&record).await.unwrap().unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.status, FileStatus::Pending);
        assert_ne!(retry.id, record.id);

        // Claim now resolves to the latest attempt.
        let claimed = repo.insert_if_absent("a.jl", "e1", &metadata()).await.unwrap();
        assert_eq!(claimed.id, retry.id);
        assert!(repo.insert_retry_attempt(&record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_stuck_and_delete_terminal() {
        let repo = SqliteRepository::in_memory().unwrap();
        let stuck = repo.insert_if_absent("a.jl", "e1", &metadata()).await.unwrap();
        let done = repo.insert_if_absent("b.jl", "e1", &metadata()).await.unwrap();
        let pending = repo.insert_if_absent("c.jl", "e1", &metadata()).await.unwrap();

        let three_hours_ago = Utc::now() - chrono::Duration::hours(3);
        repo.transition(
            stuck.id,
            &[FileStatus::Pending],
            FileStatus::InProgress,
            TransitionUpdate {
                started_at: Some(three_hours_ago),
                ..TransitionUpdate::default()
            },
        )
        .await
        .unwrap();
        repo.transition(
            done.id,
            &[FileStatus::Pending],
            FileStatus::Completed,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();

        let found = repo
            .find_stuck(Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![stuck.id]);

        let deleted = repo
            .delete_terminal_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.find_by_id(done.id).await.unwrap().is_none());
        assert!(repo.find_by_id(stuck.id).await.unwrap().is_some());
        assert!(repo.find_by_id(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reviews_are_unique_per_provider_external_id() {
        let repo = SqliteRepository::in_memory().unwrap();
        let agoda = repo.insert_or_get("agoda", "Agoda").await.unwrap();
        let again = repo.insert_or_get("agoda", "Agoda").await.unwrap();
        assert_eq!(agoda, again);

        let inserted = repo
            .insert_batch(&[review(agoda.id, 1), review(agoda.id, 2)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        let inserted = repo
            .insert_batch(&[review(agoda.id, 2), review(agoda.id, 3)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        assert!(repo.exists_by_external_id(agoda.id, 3).await.unwrap());
        assert!(!repo.exists_by_external_id(agoda.id, 4).await.unwrap());

        let stats = repo.provider_statistics().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].provider_code, "agoda");
        assert_eq!(stats[0].review_count, 3);
        assert!((stats[0].average_rating.unwrap() - 6.4).abs() < 1e-9);
        assert!(stats[0].latest_review_date.is_some());
    }

    #[test]
    fn test_lease_is_exclusive_until_released() {
        let repo = SqliteRepository::in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(repo.try_acquire_lease("review-processing", "worker-a", ttl).unwrap());
        assert!(!repo.try_acquire_lease("review-processing", "worker-b", ttl).unwrap());
        // Re-entrant for the holder.
        assert!(repo.try_acquire_lease("review-processing", "worker-a", ttl).unwrap());

        assert!(!repo.release_lease("review-processing", "worker-b").unwrap());
        assert!(repo.release_lease("review-processing", "worker-a").unwrap());
        assert!(repo.try_acquire_lease("review-processing", "worker-b", ttl).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let repo = SqliteRepository::in_memory().unwrap();
        assert!(repo
            .try_acquire_lease("cleanup", "worker-a", Duration::ZERO)
            .unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(repo
            .try_acquire_lease("cleanup", "worker-b", Duration::from_secs(60))
            .unwrap());
    }
}
