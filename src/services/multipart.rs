//! Multipart upload coordination.
//!
//! Persists a large payload as one object despite needing many smaller
//! transfers. The payload is cut into fixed-size parts, uploaded through a
//! bounded pool of workers, and committed with the part list sorted by
//! number. If any part exhausts its retry budget the whole session is
//! aborted before the failure is reported, so no orphaned upload is ever
//! left holding storage. Payloads at or below one part size skip the
//! protocol and go through a single put.

use crate::errors::{DriveError, DriveResult};
use crate::models::history::UploadRecord;
use crate::models::upload::{StoredUpload, UploadSession, UploadState};
use crate::services::gateway::Gateway;
use crate::services::history::HistoryCatalog;
use crate::services::keys;
use crate::store::{PartEtag, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct UploadCoordinator {
    gateway: Gateway,
    part_size: usize,
    concurrency: usize,
    history: Option<HistoryCatalog>,
}

impl UploadCoordinator {
    pub fn new(
        gateway: Gateway,
        part_size: usize,
        concurrency: usize,
        history: Option<HistoryCatalog>,
    ) -> Self {
        Self {
            gateway,
            part_size: part_size.max(1),
            concurrency: concurrency.max(1),
            history,
        }
    }

    /// Upload one file into `folder` (tenant-relative, may be empty for the
    /// root). Returns the stored key and size, or the first terminal error.
    ///
    /// Each call owns its own session; concurrent calls never share state,
    /// so one file's abort cannot touch a sibling's upload.
    pub async fn upload(
        &self,
        tenant: &str,
        folder: &str,
        filename: &str,
        content_type: Option<&str>,
        payload: Bytes,
    ) -> DriveResult<StoredUpload> {
        let relative = if folder.is_empty() {
            filename.to_string()
        } else {
            format!("{folder}/{filename}")
        };
        let key = keys::object_key(tenant, &relative)?;
        let size_bytes = payload.len() as i64;

        let etag = if payload.len() <= self.part_size {
            let etag = format!("{:x}", md5::compute(&payload));
            self.gateway.put(&key, payload, content_type).await?;
            Some(etag)
        } else {
            self.multipart_upload(&key, payload).await?;
            None
        };

        let stored = StoredUpload {
            key,
            size_bytes,
            etag,
        };
        info!(key = %stored.key, size_bytes, "upload committed");
        self.notify_history(tenant, &stored);
        Ok(stored)
    }

    async fn multipart_upload(&self, key: &str, payload: Bytes) -> DriveResult<()> {
        let upload_id = self.gateway.begin_multipart(key).await?;
        let mut session = UploadSession::new(upload_id.clone(), key.to_string());
        let total_parts = payload.len().div_ceil(self.part_size) as u32;
        debug!(key, upload_id = %session.upload_id, total_parts, "multipart session opened");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<Result<PartEtag, (u32, StoreError)>> = JoinSet::new();
        for part_number in 1..=total_parts {
            let start = (part_number as usize - 1) * self.part_size;
            let end = (start + self.part_size).min(payload.len());
            let chunk = payload.slice(start..end);
            let gateway = self.gateway.clone();
            let semaphore = semaphore.clone();
            let upload_id = upload_id.clone();
            let key = key.to_string();
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| (part_number, StoreError::Unavailable("worker pool closed".into())))?;
                let etag = gateway
                    .upload_part(&upload_id, &key, part_number, chunk)
                    .await
                    .map_err(|err| (part_number, err))?;
                Ok(PartEtag { part_number, etag })
            });
        }

        let mut failure: Option<(u32, String)> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(part)) => session.record_part(part),
                Ok(Err((part_number, err))) => {
                    if failure.is_none() {
                        failure = Some((part_number, err.to_string()));
                        // First terminal failure sinks the session; stop
                        // feeding the store.
                        workers.abort_all();
                    }
                }
                Err(join_err) => {
                    if failure.is_none() && !join_err.is_cancelled() {
                        failure = Some((0, join_err.to_string()));
                        workers.abort_all();
                    }
                }
            }
        }

        if failure.is_none() && !session.finalize_parts(total_parts) {
            failure = Some((0, "recorded part set is not dense".into()));
        }

        if let Some((part_number, reason)) = failure {
            self.abort_session(&mut session).await;
            return Err(DriveError::PartUploadFailed {
                key: key.to_string(),
                part_number,
                reason,
            });
        }

        session.state = UploadState::Completing;
        if let Err(err) = self
            .gateway
            .complete_multipart(&upload_id, key, &session.parts)
            .await
        {
            self.abort_session(&mut session).await;
            return Err(err.into());
        }
        session.state = UploadState::Committed;
        debug!(key, upload_id = %session.upload_id, "multipart session committed");
        Ok(())
    }

    /// Release the in-progress upload. Best-effort: the session is reported
    /// failed either way, but an abort that itself fails leaves storage for
    /// the store's lifecycle cleanup and is worth a warning.
    async fn abort_session(&self, session: &mut UploadSession) {
        if let Err(err) = self
            .gateway
            .abort_multipart(&session.upload_id, &session.key)
            .await
        {
            warn!(key = %session.key, upload_id = %session.upload_id, "failed to abort multipart session: {err}");
        }
        session.state = UploadState::Aborted;
    }

    fn notify_history(&self, tenant: &str, stored: &StoredUpload) {
        let Some(history) = self.history.clone() else {
            return;
        };
        let record = UploadRecord::new(tenant, &stored.key, stored.size_bytes, stored.etag.clone());
        tokio::spawn(async move {
            if let Err(err) = history.record(&record).await {
                warn!(key = %record.key, "failed to catalogue upload: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::RetryPolicy;
    use crate::store::{MemoryStore, ObjectStore};
    use crate::test_support::FlakyStore;

    const MIB: usize = 1024 * 1024;

    fn coordinator(part_size: usize) -> (Arc<MemoryStore>, Arc<FlakyStore>, UploadCoordinator) {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let gateway = Gateway::new(flaky.clone(), RetryPolicy::no_backoff());
        let coordinator = UploadCoordinator::new(gateway, part_size, 4, None);
        (memory, flaky, coordinator)
    }

    #[tokio::test]
    async fn small_payload_skips_the_multipart_protocol() {
        let (memory, flaky, coordinator) = coordinator(8 * MIB);
        let stored = coordinator
            .upload("u1", "", "note.txt", Some("text/plain"), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(stored.key, "users/u1/note.txt");
        assert_eq!(stored.size_bytes, 5);
        assert!(stored.etag.is_some());
        assert_eq!(flaky.begin_calls(), 0);
        assert_eq!(memory.object_size("users/u1/note.txt"), Some(5));
    }

    #[tokio::test]
    async fn seventeen_mib_payload_becomes_three_parts() {
        let (memory, flaky, coordinator) = coordinator(8 * MIB);
        let payload = Bytes::from(vec![0xA5u8; 17 * MIB]);
        let stored = coordinator
            .upload("u1", "videos", "clip.bin", None, payload)
            .await
            .unwrap();

        assert_eq!(stored.key, "users/u1/videos/clip.bin");
        assert_eq!(memory.object_size("users/u1/videos/clip.bin"), Some(17 * MIB));

        let mut parts = flaky.part_log();
        parts.sort();
        assert_eq!(parts, vec![(1, 8 * MIB), (2, 8 * MIB), (3, MIB)]);

        // Commit sees exactly 1..=3 ascending, whatever order workers ran.
        assert_eq!(flaky.completed_orders(), vec![vec![1, 2, 3]]);
        assert_eq!(memory.open_upload_count(), 0);
    }

    #[tokio::test]
    async fn a_failed_part_aborts_the_whole_session() {
        let (memory, flaky, coordinator) = coordinator(MIB);
        flaky.fail_parts_for("users/u1/doomed.bin");

        let err = coordinator
            .upload("u1", "", "doomed.bin", None, Bytes::from(vec![0u8; 3 * MIB]))
            .await
            .unwrap_err();

        assert!(matches!(err, DriveError::PartUploadFailed { .. }));
        assert_eq!(memory.open_upload_count(), 0);
        assert!(memory.object_size("users/u1/doomed.bin").is_none());
        assert!(flaky.completed_orders().is_empty());
    }

    #[tokio::test]
    async fn sibling_uploads_survive_one_permanent_failure() {
        let (memory, flaky, coordinator) = coordinator(MIB);
        flaky.fail_parts_for("users/u1/bad.bin");

        let mut tasks = JoinSet::new();
        for name in ["good-a.bin", "bad.bin", "good-b.bin"] {
            let coordinator = coordinator.clone();
            tasks.spawn(async move {
                let outcome = coordinator
                    .upload("u1", "", name, None, Bytes::from(vec![1u8; 2 * MIB]))
                    .await;
                (name, outcome)
            });
        }

        let mut ok = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = joined.unwrap();
            match outcome {
                Ok(_) => ok += 1,
                Err(_) => {
                    assert_eq!(name, "bad.bin");
                    failed += 1;
                }
            }
        }

        assert_eq!((ok, failed), (2, 1));
        assert_eq!(memory.object_size("users/u1/good-a.bin"), Some(2 * MIB));
        assert_eq!(memory.object_size("users/u1/good-b.bin"), Some(2 * MIB));
        assert!(memory.object_size("users/u1/bad.bin").is_none());
        // No session, failed or not, is left open.
        assert_eq!(memory.open_upload_count(), 0);
    }

    #[tokio::test]
    async fn invalid_paths_fail_before_any_store_call() {
        let (memory, flaky, coordinator) = coordinator(MIB);
        let err = coordinator
            .upload("u1", "../escape", "x.txt", None, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::InvalidPath(_)));
        assert_eq!(flaky.put_attempts(), 0);
        assert_eq!(flaky.begin_calls(), 0);
        assert_eq!(memory.object_count(), 0);
    }

    #[tokio::test]
    async fn commits_are_catalogued_fire_and_forget() {
        use crate::services::history::HistoryCatalog;
        use crate::store::local::apply_schema;
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        let catalog = HistoryCatalog::new(Arc::new(pool));

        let memory: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(memory.clone() as Arc<dyn ObjectStore>, RetryPolicy::no_backoff());
        let coordinator = UploadCoordinator::new(gateway, 8 * MIB, 4, Some(catalog.clone()));

        coordinator
            .upload("u1", "", "a.txt", None, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        // The catalog write is spawned; give it a moment to land.
        for _ in 0..50 {
            if !catalog.recent_for_tenant("u1", 10).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let rows = catalog.recent_for_tenant("u1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "users/u1/a.txt");
    }
}
