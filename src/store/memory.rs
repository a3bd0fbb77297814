//! In-memory object store.
//!
//! Keeps whole objects in a `BTreeMap` so listings come back in ascending
//! key order for free. Pagination, delimiter grouping and multipart sessions
//! follow the same semantics as the disk-backed store, which makes this the
//! substrate for unit tests and a usable backend for throwaway deployments.

use super::{
    BatchDeleteOutcome, ByteStream, FailedDelete, ListPage, MAX_BATCH_KEYS, MAX_KEYS_PER_PAGE,
    ObjectRecord, ObjectStore, PartEtag, StoreError, StoreResult, compute_common_prefix,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredObject {
    content: Bytes,
    content_type: Option<String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of multipart sessions that have been begun but neither
    /// completed nor aborted.
    pub fn open_upload_count(&self) -> usize {
        self.inner.lock().expect("memory store poisoned").uploads.len()
    }

    /// Total object count, markers included.
    pub fn object_count(&self) -> usize {
        self.inner.lock().expect("memory store poisoned").objects.len()
    }

    /// Size of a stored object, if present.
    pub fn object_size(&self, key: &str) -> Option<usize> {
        self.inner
            .lock()
            .expect("memory store poisoned")
            .objects
            .get(key)
            .map(|obj| obj.content.len())
    }

    /// Etag of a stored object, if present.
    pub fn object_etag(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("memory store poisoned")
            .objects
            .get(key)
            .map(|obj| obj.etag.clone())
    }

    /// Content type recorded for a stored object, if any was supplied.
    pub fn object_content_type(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("memory store poisoned")
            .objects
            .get(key)
            .and_then(|obj| obj.content_type.clone())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, content: Bytes, content_type: Option<&str>) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let etag = format!("{:x}", md5::compute(&content));
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                content,
                content_type: content_type.map(str::to_string),
                etag,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        let content = {
            let inner = self.inner.lock().expect("memory store poisoned");
            inner
                .objects
                .get(key)
                .map(|obj| obj.content.clone())
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?
        };
        Ok(Box::pin(futures::stream::iter([Ok(content)])))
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let inner = self.inner.lock().expect("memory store poisoned");

        let mut records = Vec::new();
        for (key, obj) in inner.objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(after) = token {
                if key.as_str() <= after {
                    continue;
                }
            }
            records.push(ObjectRecord {
                key: key.clone(),
                size_bytes: obj.content.len() as i64,
                last_modified: obj.last_modified,
            });
            if records.len() > MAX_KEYS_PER_PAGE {
                break;
            }
        }

        let mut next_token = None;
        if records.len() > MAX_KEYS_PER_PAGE {
            records.pop();
            next_token = records.last().map(|rec| rec.key.clone());
        }

        let mut objects = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for record in records {
            match delimiter.and_then(|d| compute_common_prefix(&record.key, prefix, d)) {
                Some(grouped) => {
                    common_prefixes.insert(grouped);
                }
                None => objects.push(record),
            }
        }

        Ok(ListPage {
            objects,
            common_prefixes: common_prefixes.into_iter().collect(),
            next_token,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.objects.remove(key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<BatchDeleteOutcome> {
        if keys.len() > MAX_BATCH_KEYS {
            return Err(StoreError::BatchTooLarge {
                size: keys.len(),
                max: MAX_BATCH_KEYS,
            });
        }
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            inner.objects.remove(key);
            outcome.deleted.push(key.clone());
        }
        Ok(outcome)
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let mut copied = inner
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(source_key.to_string()))?;
        copied.last_modified = Utc::now();
        inner.objects.insert(dest_key.to_string(), copied);
        Ok(())
    }

    async fn begin_multipart(&self, key: &str) -> StoreResult<String> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let upload_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        _key: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StoreResult<String> {
        let etag = format!("{:x}", md5::compute(&bytes));
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::UploadNotFound(upload_id.to_string()))?;
        upload.parts.insert(part_number, (etag.clone(), bytes));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[PartEtag],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if !inner.uploads.get(upload_id).is_some_and(|u| u.key == key) {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }
        let Some(upload) = inner.uploads.remove(upload_id) else {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        };

        let mut assembled = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => {
                    assembled.extend_from_slice(bytes);
                }
                _ => {
                    return Err(StoreError::MissingPart {
                        upload_id: upload_id.to_string(),
                        part_number: part.part_number,
                    });
                }
            }
        }

        let content = Bytes::from(assembled);
        let etag = format!("{:x}", md5::compute(&content));
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                content,
                content_type: None,
                etag,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str, _key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.uploads.remove(upload_id);
        Ok(())
    }
}
