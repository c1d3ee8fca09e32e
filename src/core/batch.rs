//! Batch processor: validate, transform, de-duplicate and persist a chunk of
//! raw records.

use crate::core::transformer::ReviewTransformer;
use crate::core::validator::ReviewValidator;
use crate::domain::model::{BatchResult, CanonicalReview, Provider, RawRecord};
use crate::domain::ports::{ProviderRepository, ReviewRepository};
use crate::utils::error::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Cap on error strings kept per result.
    pub max_errors: usize,
    /// Rows per insert transaction.
    pub persist_chunk_size: usize,
    pub large_batch_threshold: usize,
    pub large_batch_chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_errors: 50,
            persist_chunk_size: 100,
            large_batch_threshold: 10_000,
            large_batch_chunk_size: 1_000,
        }
    }
}

pub struct BatchProcessor {
    validator: ReviewValidator,
    transformer: ReviewTransformer,
    providers: Arc<dyn ProviderRepository>,
    reviews: Arc<dyn ReviewRepository>,
    /// Keyed by provider code. Only an optimisation: a miss goes to the repository.
    provider_cache: Mutex<HashMap<String, Provider>>,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(
        validator: ReviewValidator,
        providers: Arc<dyn ProviderRepository>,
        reviews: Arc<dyn ReviewRepository>,
        config: BatchConfig,
    ) -> Self {
        Self {
            validator,
            transformer: ReviewTransformer::new(),
            providers,
            reviews,
            provider_cache: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Never fails: per-record problems are counted, and a persistence
    /// failure is reported through `persistence_error` (status `FAILED`).
    pub async fn process_batch(&self, records: Vec<RawRecord>) -> BatchResult {
        self.process_batch_within(records, u64::MAX).await
    }

    /// Like [`process_batch`](Self::process_batch), but stops at the record
    /// whose failure takes the invalid count past `error_budget`. Records
    /// before that line are still persisted; the rest are left untouched.
    pub async fn process_batch_within(&self, records: Vec<RawRecord>, error_budget: u64) -> BatchResult {
        if records.len() <= self.config.large_batch_threshold {
            return self.process_chunk(&records, error_budget).await;
        }

        let chunk_size = self.config.large_batch_chunk_size.max(1);
        tracing::info!(
            "Large batch of {} records, processing in chunks of {}",
            records.len(),
            chunk_size
        );
        let mut total = BatchResult::default();
        for chunk in records.chunks(chunk_size) {
            let result = self
                .process_chunk(chunk, error_budget.saturating_sub(total.invalid))
                .await;
            let stop = result.is_fatal() || result.budget_exhausted;
            total.merge(result, self.config.max_errors);
            if stop {
                break;
            }
        }
        total
    }

    async fn process_chunk(&self, records: &[RawRecord], error_budget: u64) -> BatchResult {
        let started = Instant::now();
        let cap = self.config.max_errors;
        let mut result = BatchResult::default();
        let mut seen = HashSet::new();
        let mut pending: Vec<CanonicalReview> = Vec::new();

        for raw in records {
            result.processed += 1;
            let outcome = self.validator.validate(raw);
            if !outcome.is_valid() {
                result.invalid += 1;
                tracing::debug!("Line {} invalid: {}", raw.line_number, outcome.errors.join("; "));
                for violation in outcome.errors {
                    result.record_error(format!("line {}: {}", raw.line_number, violation), cap);
                }
                if result.invalid > error_budget {
                    result.budget_exhausted = true;
                    break;
                }
                continue;
            }

            let provider_name = raw.platform.as_deref().unwrap_or_default();
            let provider = match self.resolve_provider(provider_name).await {
                Ok(provider) => provider,
                Err(e) => {
                    result.persistence_error = Some(format!("provider lookup failed: {}", e));
                    break;
                }
            };

            let review = match self.transformer.transform(raw, &provider) {
                Ok(review) => review,
                Err(e) => {
                    result.invalid += 1;
                    result.record_error(format!("line {}: {}", raw.line_number, e), cap);
                    tracing::debug!("Line {} could not be transformed: {} | {}", raw.line_number, e, raw.raw_line);
                    if result.invalid > error_budget {
                        result.budget_exhausted = true;
                        break;
                    }
                    continue;
                }
            };
            result.valid += 1;

            if !seen.insert((provider.id, review.external_review_id)) {
                result.duplicates += 1;
                continue;
            }
            match self
                .reviews
                .exists_by_external_id(provider.id, review.external_review_id)
                .await
            {
                Ok(true) => {
                    result.duplicates += 1;
                    tracing::debug!(
                        "Line {}: review {} already stored",
                        raw.line_number,
                        review.external_review_id
                    );
                }
                Ok(false) => pending.push(review),
                Err(e) => {
                    result.persistence_error = Some(format!("duplicate check failed: {}", e));
                    break;
                }
            }
        }

        if result.budget_exhausted {
            tracing::warn!(
                "⚠️ Error budget of {} used up after {} records; {} earlier reviews kept",
                error_budget,
                result.processed,
                pending.len()
            );
        }
        if result.persistence_error.is_none() {
            self.persist(&pending, &mut result).await;
        }

        result.elapsed = started.elapsed();
        result.finalize_status();
        result
    }

    /// Writes in sub-batches; the first failing sub-batch stops the rest.
    async fn persist(&self, pending: &[CanonicalReview], result: &mut BatchResult) {
        let chunk_size = self.config.persist_chunk_size.max(1);
        let total = pending.len().div_ceil(chunk_size);

        for (index, chunk) in pending.chunks(chunk_size).enumerate() {
            match self.reviews.insert_batch(chunk).await {
                Ok(inserted) => {
                    result.persisted += inserted;
                    // Rows written by someone else since the duplicate check
                    result.duplicates += chunk.len() as u64 - inserted.min(chunk.len() as u64);
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Persisting sub-batch {}/{} failed: {}",
                        index + 1,
                        total,
                        e
                    );
                    result.persistence_error =
                        Some(format!("sub-batch {}/{} failed: {}", index + 1, total, e));
                    return;
                }
            }
        }
    }

    async fn resolve_provider(&self, name: &str) -> Result<Provider> {
        let code = Provider::code_for(name);
        if let Some(provider) = self.cached_provider(&code) {
            return Ok(provider);
        }

        let provider = match self.providers.find_by_code(&code).await? {
            Some(provider) => provider,
            None => {
                tracing::info!("Registering new provider '{}' ({})", name.trim(), code);
                self.providers.insert_or_get(&code, name.trim()).await?
            }
        };
        if let Ok(mut cache) = self.provider_cache.lock() {
            cache.insert(code, provider.clone());
        }
        Ok(provider)
    }

    fn cached_provider(&self, code: &str) -> Option<Provider> {
        self.provider_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(code).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteRepository;
    use crate::domain::model::{BatchStatus, ProviderStatistics};
    use crate::utils::error::EtlError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(line: usize, review_id: i64, rating: f64) -> RawRecord {
        RawRecord {
            hotel_id: Some(10984),
            platform: Some("Agoda".to_string()),
            hotel_name: Some("Oscar Saigon Hotel".to_string()),
            comment: Some(json!({
                "hotelReviewId": review_id,
                "rating": rating,
                "reviewDate": "2024-05-01T10:00:00+07:00",
                "reviewComments": format!("review {}", review_id)
            })),
            line_number: line,
            raw_line: String::new(),
        }
    }

    /// Counts insert calls and fails on the configured one (1-based).
    struct FlakyReviews {
        fail_on_call: Option<usize>,
        insert_calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl FlakyReviews {
        fn new(fail_on_call: Option<usize>) -> Self {
            Self {
                fail_on_call,
                insert_calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReviewRepository for FlakyReviews {
        async fn exists_by_external_id(&self, _provider_id: i64, _external_id: i64) -> Result<bool> {
            Ok(false)
        }

        async fn insert_batch(&self, reviews: &[CanonicalReview]) -> Result<u64> {
            let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.batch_sizes.lock().unwrap().push(reviews.len());
            if self.fail_on_call == Some(call) {
                return Err(EtlError::persistence("disk full"));
            }
            Ok(reviews.len() as u64)
        }

        async fn provider_statistics(&self) -> Result<Vec<ProviderStatistics>> {
            Ok(Vec::new())
        }
    }

    fn processor(reviews: Arc<dyn ReviewRepository>, config: BatchConfig) -> BatchProcessor {
        let providers = Arc::new(SqliteRepository::in_memory().unwrap());
        BatchProcessor::new(ReviewValidator::default(), providers, reviews, config)
    }

    #[tokio::test]
    async fn test_persistence_failure_stops_remaining_sub_batches() {
        let reviews = Arc::new(FlakyReviews::new(Some(2)));
        let processor = processor(reviews.clone(), BatchConfig::default());
        let records = (1..=250).map(|i| raw(i, i as i64, 8.0)).collect();

        let result = processor.process_batch(records).await;

        assert_eq!(result.status, BatchStatus::Failed);
        assert!(result.is_fatal());
        assert_eq!(*reviews.batch_sizes.lock().unwrap(), vec![100, 100]);
        assert_eq!(result.persisted, 100);
        assert_eq!(result.valid, 250);
    }

    #[tokio::test]
    async fn test_sub_batches_of_one_hundred() {
        let reviews = Arc::new(FlakyReviews::new(None));
        let processor = processor(reviews.clone(), BatchConfig::default());
        let records = (1..=250).map(|i| raw(i, i as i64, 8.0)).collect();

        let result = processor.process_batch(records).await;

        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(*reviews.batch_sizes.lock().unwrap(), vec![100, 100, 50]);
        assert_eq!(result.persisted, 250);
    }

    #[tokio::test]
    async fn test_counts_invalid_and_duplicates() {
        let repository = Arc::new(SqliteRepository::in_memory().unwrap());
        let processor = BatchProcessor::new(
            ReviewValidator::default(),
            repository.clone(),
            repository.clone(),
            BatchConfig::default(),
        );

        let first = processor
            .process_batch(vec![raw(1, 100, 8.0), raw(2, 101, 11.0), raw(3, 100, 8.0)])
            .await;
        assert_eq!(first.processed, 3);
        assert_eq!(first.valid, 2);
        assert_eq!(first.invalid, 1);
        assert_eq!(first.duplicates, 1);
        assert_eq!(first.persisted, 1);
        assert_eq!(first.status, BatchStatus::Failed);
        assert!(first.errors[0].starts_with("line 2: Rating must be between 0 and 10"));

        // Same review in a later run is a duplicate, not an error
        let second = processor.process_batch(vec![raw(1, 100, 8.0)]).await;
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.persisted, 0);
        assert_eq!(second.status, BatchStatus::Completed);
        assert!(second.errors.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_completed() {
        let processor = processor(Arc::new(FlakyReviews::new(None)), BatchConfig::default());
        let result = processor.process_batch(Vec::new()).await;
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_error_list_is_capped() {
        let config = BatchConfig {
            max_errors: 5,
            ..BatchConfig::default()
        };
        let processor = processor(Arc::new(FlakyReviews::new(None)), config);
        let records = (1..=20).map(|i| raw(i, i as i64, 42.0)).collect();

        let result = processor.process_batch(records).await;

        assert_eq!(result.invalid, 20);
        assert_eq!(result.errors.len(), 5);
        assert_eq!(result.status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_large_batches_are_rechunked() {
        let reviews = Arc::new(FlakyReviews::new(None));
        let config = BatchConfig {
            large_batch_threshold: 10,
            large_batch_chunk_size: 4,
            ..BatchConfig::default()
        };
        let processor = processor(reviews.clone(), config);
        let records = (1..=25).map(|i| raw(i, i as i64, 7.0)).collect();

        let result = processor.process_batch(records).await;

        assert_eq!(result.processed, 25);
        assert_eq!(result.persisted, 25);
        assert_eq!(
            *reviews.batch_sizes.lock().unwrap(),
            vec![4, 4, 4, 4, 4, 4, 1]
        );
    }

    #[tokio::test]
    async fn test_error_budget_stops_before_later_records() {
        let reviews = Arc::new(FlakyReviews::new(None));
        let processor = processor(reviews.clone(), BatchConfig::default());
        let records = (1..=100)
            .map(|i| raw(i, i as i64, if (11..=20).contains(&i) { 42.0 } else { 8.0 }))
            .collect();

        let result = processor.process_batch_within(records, 5).await;

        assert!(result.budget_exhausted);
        assert_eq!(result.invalid, 6);
        // Lines 1-10 precede the cutoff at line 16
        assert_eq!(result.processed, 16);
        assert_eq!(result.persisted, 10);
        assert_eq!(*reviews.batch_sizes.lock().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn test_error_budget_carries_across_large_batch_chunks() {
        let reviews = Arc::new(FlakyReviews::new(None));
        let config = BatchConfig {
            large_batch_threshold: 10,
            large_batch_chunk_size: 4,
            ..BatchConfig::default()
        };
        let processor = processor(reviews.clone(), config);
        let records = (1..=20).map(|i| raw(i, i as i64, 42.0)).collect();

        let result = processor.process_batch_within(records, 5).await;

        assert!(result.budget_exhausted);
        assert_eq!(result.invalid, 6);
        assert_eq!(result.processed, 6);
        assert!(reviews.batch_sizes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_budget_not_reached_processes_everything() {
        let processor = processor(Arc::new(FlakyReviews::new(None)), BatchConfig::default());
        let records = (1..=10)
            .map(|i| raw(i, i as i64, if i % 2 == 0 { 42.0 } else { 8.0 }))
            .collect();

        let result = processor.process_batch_within(records, 5).await;

        assert!(!result.budget_exhausted);
        assert_eq!(result.processed, 10);
        assert_eq!(result.persisted, 5);
    }
}
