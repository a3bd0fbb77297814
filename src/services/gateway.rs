//! Retrying gateway over the raw object-store client.
//!
//! Every primitive call gets the same treatment: transient
//! (`StoreError::Unavailable`) failures are retried with bounded exponential
//! backoff before surfacing; everything else propagates immediately. The
//! gateway also owns batch chunking, so no caller can ever hand the store an
//! oversize delete batch.

use crate::store::{
    BatchDeleteOutcome, ByteStream, FailedDelete, ListPage, MAX_BATCH_KEYS, ObjectStore, PartEtag,
    StoreError, StoreResult,
};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Bounded retry schedule: `max_attempts` tries total, delay doubling from
/// `base_delay` between them.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Immediate retries, used by tests.
    pub fn no_backoff() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Long-lived, cheaply clonable handle shared by every service.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(StoreError::Unavailable(reason)) if attempt + 1 < self.retry.max_attempts => {
                    warn!(op, attempt, %reason, "transient store failure, backing off");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn put(
        &self,
        key: &str,
        content: Bytes,
        content_type: Option<&str>,
    ) -> StoreResult<()> {
        self.with_retry("put", || self.store.put(key, content.clone(), content_type))
            .await
    }

    pub async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        self.with_retry("get", || self.store.get(key)).await
    }

    pub async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> StoreResult<ListPage> {
        self.with_retry("list", || self.store.list_page(prefix, delimiter, token))
            .await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_retry("delete", || self.store.delete(key)).await
    }

    /// Delete any number of keys, chunked to the store's batch ceiling.
    /// Per-key failures accumulate in the outcome instead of aborting the
    /// remaining chunks; a chunk that exhausts its retry budget is reported
    /// as a failure of each of its keys, so keys deleted by earlier chunks
    /// are never dropped from the outcome.
    pub async fn delete_batch(&self, keys: &[String]) -> BatchDeleteOutcome {
        let mut outcome = BatchDeleteOutcome::default();
        for chunk in keys.chunks(MAX_BATCH_KEYS) {
            match self
                .with_retry("delete_batch", || self.store.delete_batch(chunk))
                .await
            {
                Ok(partial) => outcome.merge(partial),
                Err(err) => {
                    let reason = err.to_string();
                    outcome.failed.extend(chunk.iter().map(|key| FailedDelete {
                        key: key.clone(),
                        reason: reason.clone(),
                    }));
                }
            }
        }
        outcome
    }

    pub async fn copy(&self, source_key: &str, dest_key: &str) -> StoreResult<()> {
        self.with_retry("copy", || self.store.copy(source_key, dest_key))
            .await
    }

    pub async fn begin_multipart(&self, key: &str) -> StoreResult<String> {
        self.with_retry("begin_multipart", || self.store.begin_multipart(key))
            .await
    }

    pub async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StoreResult<String> {
        self.with_retry("upload_part", || {
            self.store.upload_part(upload_id, key, part_number, bytes.clone())
        })
        .await
    }

    pub async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[PartEtag],
    ) -> StoreResult<()> {
        self.with_retry("complete_multipart", || {
            self.store.complete_multipart(upload_id, key, parts)
        })
        .await
    }

    pub async fn abort_multipart(&self, upload_id: &str, key: &str) -> StoreResult<()> {
        self.with_retry("abort_multipart", || {
            self.store.abort_multipart(upload_id, key)
        })
        .await
    }
}
