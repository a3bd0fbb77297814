//! Shared helpers for unit tests: a delegating store wrapper that can
//! inject transient failures and record which primitive calls it saw.

use crate::store::{
    BatchDeleteOutcome, ByteStream, FailedDelete, ListPage, ObjectStore, PartEtag, StoreError,
    StoreResult,
};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Injections {
    fail_next_puts: usize,
    fail_next_batches: usize,
    fail_parts_for: HashSet<String>,
    fail_gets_for: HashSet<String>,
    fail_deletes_for: HashSet<String>,
}

/// Wraps any store, forwarding every call while counting attempts, logging
/// batch/part shapes, and optionally failing selected calls with
/// `StoreError::Unavailable`.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    injections: Mutex<Injections>,
    put_attempts: AtomicUsize,
    get_attempts: AtomicUsize,
    begin_calls: AtomicUsize,
    list_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    part_log: Mutex<Vec<(u32, usize)>>,
    completed_orders: Mutex<Vec<Vec<u32>>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            injections: Mutex::new(Injections::default()),
            put_attempts: AtomicUsize::new(0),
            get_attempts: AtomicUsize::new(0),
            begin_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            part_log: Mutex::new(Vec::new()),
            completed_orders: Mutex::new(Vec::new()),
        }
    }

    /// The next `n` puts fail with `Unavailable`.
    pub fn fail_next_puts(&self, n: usize) {
        self.injections.lock().unwrap().fail_next_puts = n;
    }

    /// Every `upload_part` for `key` fails with `Unavailable`.
    pub fn fail_parts_for(&self, key: &str) {
        self.injections.lock().unwrap().fail_parts_for.insert(key.to_string());
    }

    /// Every `get` of `key` fails with `Unavailable`.
    pub fn fail_gets_for(&self, key: &str) {
        self.injections.lock().unwrap().fail_gets_for.insert(key.to_string());
    }

    /// The next `n` calls to `delete_batch` fail with `Unavailable`.
    pub fn fail_next_batches(&self, n: usize) {
        self.injections.lock().unwrap().fail_next_batches = n;
    }

    /// Every batch delete of `key` reports the key as failed instead of
    /// removing it; other keys in the batch are deleted normally.
    pub fn fail_deletes_for(&self, key: &str) {
        self.injections.lock().unwrap().fail_deletes_for.insert(key.to_string());
    }

    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn get_attempts(&self) -> usize {
        self.get_attempts.load(Ordering::SeqCst)
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Sizes of every batch handed to `delete_batch`, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    /// `(part_number, byte_len)` of every successful `upload_part`.
    pub fn part_log(&self) -> Vec<(u32, usize)> {
        self.part_log.lock().unwrap().clone()
    }

    /// Part-number sequences handed to `complete_multipart`, in call order.
    pub fn completed_orders(&self) -> Vec<Vec<u32>> {
        self.completed_orders.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, key: &str, content: Bytes, content_type: Option<&str>) -> StoreResult<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut injections = self.injections.lock().unwrap();
            if injections.fail_next_puts > 0 {
                injections.fail_next_puts -= 1;
                return Err(StoreError::Unavailable("injected put failure".into()));
            }
        }
        self.inner.put(key, content, content_type).await
    }

    async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        self.get_attempts.fetch_add(1, Ordering::SeqCst);
        if self.injections.lock().unwrap().fail_gets_for.contains(key) {
            return Err(StoreError::Unavailable("injected get failure".into()));
        }
        self.inner.get(key).await
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> StoreResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_page(prefix, delimiter, token).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<BatchDeleteOutcome> {
        self.batch_sizes.lock().unwrap().push(keys.len());
        let stuck: Vec<String> = {
            let mut injections = self.injections.lock().unwrap();
            if injections.fail_next_batches > 0 {
                injections.fail_next_batches -= 1;
                return Err(StoreError::Unavailable("injected batch failure".into()));
            }
            keys.iter()
                .filter(|key| injections.fail_deletes_for.contains(*key))
                .cloned()
                .collect()
        };
        if stuck.is_empty() {
            return self.inner.delete_batch(keys).await;
        }
        let passing: Vec<String> = keys.iter().filter(|key| !stuck.contains(key)).cloned().collect();
        let mut outcome = self.inner.delete_batch(&passing).await?;
        outcome.failed.extend(stuck.into_iter().map(|key| FailedDelete {
            key,
            reason: "injected delete failure".into(),
        }));
        Ok(outcome)
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> StoreResult<()> {
        self.inner.copy(source_key, dest_key).await
    }

    async fn begin_multipart(&self, key: &str) -> StoreResult<String> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.begin_multipart(key).await
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StoreResult<String> {
        if self.injections.lock().unwrap().fail_parts_for.contains(key) {
            return Err(StoreError::Unavailable("injected part failure".into()));
        }
        let len = bytes.len();
        let etag = self.inner.upload_part(upload_id, key, part_number, bytes).await?;
        self.part_log.lock().unwrap().push((part_number, len));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[PartEtag],
    ) -> StoreResult<()> {
        self.completed_orders
            .lock()
            .unwrap()
            .push(parts.iter().map(|p| p.part_number).collect());
        self.inner.complete_multipart(upload_id, key, parts).await
    }

    async fn abort_multipart(&self, upload_id: &str, key: &str) -> StoreResult<()> {
        self.inner.abort_multipart(upload_id, key).await
    }
}

/// Collect a streamed body into one buffer.
pub async fn read_stream(mut stream: ByteStream) -> Vec<u8> {
    use futures::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.expect("stream chunk"));
    }
    out
}
