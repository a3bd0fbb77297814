//! Object-store client abstraction.
//!
//! The store is flat and key-addressed: no directories, no atomic rename.
//! Everything hierarchical is emulated above this layer. Implementations
//! expose the raw primitives only; retry, backoff and batch chunking live in
//! the gateway (`services::gateway`).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::io;
use std::pin::Pin;
use thiserror::Error;

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Hard ceiling on keys per batch delete, matching S3's DeleteObjects limit.
pub const MAX_BATCH_KEYS: usize = 1000;

/// Maximum keys returned by a single listing page.
pub const MAX_KEYS_PER_PAGE: usize = 1000;

/// Streamed object body: chunks of bytes as they arrive from the store.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("delete batch of {size} keys exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("multipart upload `{upload_id}` is missing part {part_number}")]
    MissingPart { upload_id: String, part_number: u32 },
    #[error("invalid object key")]
    InvalidKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Listing metadata for a single stored object. Recomputed on every list
/// call; never cached across operations.
#[derive(Clone, Debug)]
pub struct ObjectRecord {
    pub key: String,
    pub size_bytes: i64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a listing. Callers loop on `next_token` until it is `None`.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectRecord>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// Confirmation token for one uploaded part of a multipart session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartEtag {
    pub part_number: u32,
    pub etag: String,
}

/// Per-key outcome of a batch delete. Failures are reported individually,
/// never dropped.
#[derive(Debug, Default)]
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<FailedDelete>,
}

#[derive(Debug)]
pub struct FailedDelete {
    pub key: String,
    pub reason: String,
}

impl BatchDeleteOutcome {
    pub fn merge(&mut self, other: BatchDeleteOutcome) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

/// Raw object-store primitives.
///
/// Implementations are tenant-agnostic: callers always pass fully qualified
/// keys. All methods are safe to retry; put/copy/delete are idempotent
/// overwrites and last-writer-wins at the key level.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Idempotent overwrite of `key` with `content`.
    async fn put(&self, key: &str, content: Bytes, content_type: Option<&str>) -> StoreResult<()>;

    /// Stream the body of `key`. `NotFound` if the key is absent.
    async fn get(&self, key: &str) -> StoreResult<ByteStream>;

    /// One page of keys under `prefix`, in ascending key order. With a
    /// delimiter, keys sharing a prefix up to the next delimiter collapse
    /// into `common_prefixes`.
    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> StoreResult<ListPage>;

    /// Delete one key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete up to [`MAX_BATCH_KEYS`] keys; larger inputs fail with
    /// `BatchTooLarge`.
    async fn delete_batch(&self, keys: &[String]) -> StoreResult<BatchDeleteOutcome>;

    /// Server-side copy. `NotFound` if the source is absent.
    async fn copy(&self, source_key: &str, dest_key: &str) -> StoreResult<()>;

    async fn begin_multipart(&self, key: &str) -> StoreResult<String>;

    async fn upload_part(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StoreResult<String>;

    /// Combine uploaded parts, in the order given, into the final object.
    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[PartEtag],
    ) -> StoreResult<()>;

    /// Discard an in-progress upload and its staged parts.
    async fn abort_multipart(&self, upload_id: &str, key: &str) -> StoreResult<()>;
}

/// Compute a synthetic "common prefix" for delimiter-grouped listings.
///
/// Returns `Some(prefix)` when `key` belongs to a grouped prefix beneath
/// `requested_prefix`, otherwise `None` (the key is a direct child).
pub(crate) fn compute_common_prefix(
    key: &str,
    requested_prefix: &str,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = key.strip_prefix(requested_prefix)?;
    let pos = after_prefix.find(delimiter)?;
    if pos + delimiter.len() == after_prefix.len() && after_prefix[..pos].is_empty() {
        // The prefix's own zero-byte marker, not a child.
        return None;
    }
    let mut combined = String::with_capacity(requested_prefix.len() + pos + delimiter.len());
    combined.push_str(requested_prefix);
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}

#[cfg(test)]
mod tests {
    use super::compute_common_prefix;

    #[test]
    fn groups_keys_below_the_next_delimiter() {
        assert_eq!(
            compute_common_prefix("users/u1/photos/cat.jpg", "users/u1/", "/"),
            Some("users/u1/photos/".to_string())
        );
        assert_eq!(
            compute_common_prefix("users/u1/photos/2024/cat.jpg", "users/u1/", "/"),
            Some("users/u1/photos/".to_string())
        );
    }

    #[test]
    fn direct_children_are_not_grouped() {
        assert_eq!(compute_common_prefix("users/u1/cat.jpg", "users/u1/", "/"), None);
    }

    #[test]
    fn foreign_prefixes_are_ignored() {
        assert_eq!(compute_common_prefix("users/u2/a/b", "users/u1/", "/"), None);
    }

    #[test]
    fn folder_marker_is_not_its_own_child() {
        assert_eq!(compute_common_prefix("users/u1/photos/", "users/u1/photos/", "/"), None);
    }
}
