//! Object store gateway: candidate listing, retried downloads and existence checks.

use crate::domain::model::ObjectSummary;
use crate::domain::ports::{ByteStream, ObjectPage, ObjectStore};
use crate::utils::error::{EtlError, Result};
use futures::stream::{self, Stream, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Extensions accepted as JSON Lines review files.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["jl", "jsonl"];

/// Upper bound for a single backoff sleep.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `base_delay * 2^retry`, capped at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(retry))
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

enum ListState {
    Start,
    Continue(String),
    Done,
}

pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl ObjectStoreGateway {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Lazily lists candidate review files under `prefix`, one page at a time.
    ///
    /// Every call starts a fresh listing; nothing is cached between calls.
    pub fn candidates<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Stream<Item = Result<ObjectSummary>> + Send + 'a {
        stream::try_unfold(ListState::Start, move |state| async move {
            let token = match state {
                ListState::Done => return Ok::<_, EtlError>(None),
                ListState::Start => None,
                ListState::Continue(token) => Some(token),
            };

            let page: ObjectPage = self
                .with_retry(prefix, "list", || self.store.list_page(prefix, token.clone()))
                .await?;

            let next = match page.next_token {
                Some(token) => ListState::Continue(token),
                None => ListState::Done,
            };
            let accepted: Vec<ObjectSummary> =
                page.objects.into_iter().filter(is_candidate).collect();
            Ok(Some((accepted, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<ObjectSummary, EtlError>)))
        .try_flatten()
    }

    pub async fn list_candidates(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let candidates: Vec<ObjectSummary> = self.candidates(prefix).try_collect().await?;
        tracing::debug!("Listed {} candidate files under '{}'", candidates.len(), prefix);
        Ok(candidates)
    }

    /// Opens the object body. `NotFound` and `AccessDenied` are not retried.
    pub async fn download(&self, key: &str) -> Result<ByteStream> {
        self.with_retry(key, "download", || self.store.get(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let head = self.with_retry(key, "head", || self.store.head(key)).await?;
        Ok(head.is_some())
    }

    pub async fn metadata(&self, key: &str) -> Result<ObjectSummary> {
        self.with_retry(key, "head", || self.store.head(key))
            .await?
            .ok_or_else(|| EtlError::NotFound {
                key: key.to_string(),
            })
    }

    async fn with_retry<T, F, Fut>(&self, key: &str, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_for(retry);
                    retry += 1;
                    tracing::warn!(
                        "⚠️ {} '{}' failed (retry {}/{}), retrying in {:?}: {}",
                        operation,
                        key,
                        retry,
                        self.retry.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            "❌ {} '{}' failed after {} retries: {}",
                            operation,
                            key,
                            self.retry.max_retries,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Skips empty objects, directory markers and unsupported extensions.
pub fn is_candidate(object: &ObjectSummary) -> bool {
    if object.size == 0 || object.key.ends_with('/') {
        return false;
    }
    std::path::Path::new(&object.key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ACCEPTED_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}
