//! Disk-backed object store.
//!
//! Flat key space over SQLite metadata and sharded on-disk blobs:
//! each object's bytes live at `base_path/{aa}/{bb}/{uuid}` while the key,
//! size, etag and timestamps live in the `objects` table. Listing is a plain
//! `ORDER BY key` scan with `key > token` continuation, which gives the same
//! pagination behaviour as a real remote store. Multipart parts are staged
//! under `base_path/.uploads/{upload_id}/` and concatenated on completion.

use super::{
    BatchDeleteOutcome, ByteStream, FailedDelete, ListPage, MAX_BATCH_KEYS, MAX_KEYS_PER_PAGE,
    ObjectRecord, ObjectStore, PartEtag, StoreError, StoreResult, compute_common_prefix,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;
const UPLOAD_STAGING_DIR: &str = ".uploads";

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<SqlitePool>,
    base_path: PathBuf,
}

/// Apply the embedded schema. Statements are all `IF NOT EXISTS`, so this is
/// safe to run on every startup and from tests.
pub async fn apply_schema(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let sql = include_str!("../../migrations/0001_init.sql");
    for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

impl LocalStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Reject keys that could break out of `base_path` or collide with the
    /// staging area. Trailing slashes are legal: they are folder markers.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StoreError::InvalidKey);
        }
        if key.starts_with(UPLOAD_STAGING_DIR) {
            return Err(StoreError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidKey);
        }
        Ok(())
    }

    /// Allocate a fresh sharded blob path: `base/{aa}/{bb}/{uuid}`.
    /// Two shard levels keep per-directory file counts down.
    fn new_blob_path(&self) -> (String, PathBuf) {
        let name = Uuid::new_v4().simple().to_string();
        let rel = format!("{}/{}/{}", &name[0..2], &name[2..4], name);
        let abs = self.base_path.join(&rel);
        (rel, abs)
    }

    fn blob_abs(&self, rel: &str) -> PathBuf {
        self.base_path.join(rel)
    }

    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(UPLOAD_STAGING_DIR).join(upload_id)
    }

    async fn write_blob(&self, content: &[u8]) -> StoreResult<(String, PathBuf)> {
        let (rel, abs) = self.new_blob_path();
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&abs).await?;
        if let Err(err) = file.write_all(content).await {
            let _ = fs::remove_file(&abs).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&abs).await;
            return Err(StoreError::Io(err));
        }
        Ok((rel, abs))
    }

    async fn fetch_blob_path(&self, key: &str) -> StoreResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT blob_path FROM objects WHERE key = ?")
                .bind(key)
                .fetch_optional(&*self.db)
                .await?;
        Ok(row.map(|(path,)| path))
    }

    async fn upsert_object(
        &self,
        key: &str,
        blob_rel: &str,
        size_bytes: i64,
        content_type: Option<&str>,
        etag: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (key, blob_path, size_bytes, content_type, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                blob_path = excluded.blob_path,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(key)
        .bind(blob_rel)
        .bind(size_bytes)
        .bind(content_type)
        .bind(etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Remove a superseded blob and any directories it leaves empty.
    async fn discard_blob(&self, rel: &str) {
        let abs = self.blob_abs(rel);
        match fs::remove_file(&abs).await {
            Ok(_) => debug!("removed blob {}", abs.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove blob {}: {}", abs.display(), err),
        }
        if let Some(parent) = abs.parent() {
            self.prune_empty_dirs(parent).await;
        }
    }

    /// Walk upward removing empty shard directories, stopping at `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(_) => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, content: Bytes, content_type: Option<&str>) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let previous = self.fetch_blob_path(key).await?;

        let etag = format!("{:x}", md5::compute(&content));
        let (rel, abs) = self.write_blob(&content).await?;
        if let Err(err) = self
            .upsert_object(key, &rel, content.len() as i64, content_type, &etag)
            .await
        {
            let _ = fs::remove_file(&abs).await;
            return Err(err);
        }

        if let Some(old) = previous {
            self.discard_blob(&old).await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        Self::ensure_key_safe(key)?;
        let rel = self
            .fetch_blob_path(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let file = File::open(self.blob_abs(&rel)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let fetch_limit = MAX_KEYS_PER_PAGE + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, size_bytes, last_modified FROM objects WHERE key LIKE ",
        );
        builder.push_bind(format!("{}%", like_escape(prefix)));
        builder.push(" ESCAPE '\\'");
        if let Some(after) = token {
            builder.push(" AND key > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<(String, i64, DateTime<Utc>)> =
            builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_token = rows.last().map(|(key, _, _)| key.clone());
        }

        let mut objects = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for (key, size_bytes, last_modified) in rows {
            match delimiter.and_then(|d| compute_common_prefix(&key, prefix, d)) {
                Some(grouped) => {
                    common_prefixes.insert(grouped);
                }
                None => objects.push(ObjectRecord {
                    key,
                    size_bytes,
                    last_modified,
                }),
            }
        }

        Ok(ListPage {
            objects,
            common_prefixes: common_prefixes.into_iter().collect(),
            next_token,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let Some(rel) = self.fetch_blob_path(key).await? else {
            // Deleting an absent key is a no-op, as in S3.
            return Ok(());
        };
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        self.discard_blob(&rel).await;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<BatchDeleteOutcome> {
        if keys.len() > MAX_BATCH_KEYS {
            return Err(StoreError::BatchTooLarge {
                size: keys.len(),
                max: MAX_BATCH_KEYS,
            });
        }
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            match self.delete(key).await {
                Ok(_) => outcome.deleted.push(key.clone()),
                Err(err) => outcome.failed.push(FailedDelete {
                    key: key.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> StoreResult<()> {
        Self::ensure_key_safe(source_key)?;
        Self::ensure_key_safe(dest_key)?;

        let row: Option<(String, i64, Option<String>, String)> = sqlx::query_as(
            "SELECT blob_path, size_bytes, content_type, etag FROM objects WHERE key = ?",
        )
        .bind(source_key)
        .fetch_optional(&*self.db)
        .await?;
        let (src_rel, size_bytes, content_type, etag) =
            row.ok_or_else(|| StoreError::NotFound(source_key.to_string()))?;

        let previous = self.fetch_blob_path(dest_key).await?;
        let (dst_rel, dst_abs) = self.new_blob_path();
        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(self.blob_abs(&src_rel), &dst_abs).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(source_key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;

        if let Err(err) = self
            .upsert_object(dest_key, &dst_rel, size_bytes, content_type.as_deref(), &etag)
            .await
        {
            let _ = fs::remove_file(&dst_abs).await;
            return Err(err);
        }
        if let Some(old) = previous {
            self.discard_blob(&old).await;
        }
        Ok(())
    }

    async fn begin_multipart(&self, key: &str) -> StoreResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.staging_dir(&upload_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join("key"), key).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        _key: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StoreResult<String> {
        let dir = self.staging_dir(upload_id);
        if !fs::try_exists(&dir).await? {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }
        let etag = format!("{:x}", md5::compute(&bytes));
        let part_path = dir.join(format!("{part_number:05}.part"));
        fs::write(&part_path, &bytes).await?;
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[PartEtag],
    ) -> StoreResult<()> {
        let dir = self.staging_dir(upload_id);
        let staged_key = match fs::read_to_string(dir.join("key")).await {
            Ok(staged) => staged,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::UploadNotFound(upload_id.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        if staged_key != key {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }

        let previous = self.fetch_blob_path(key).await?;
        let (rel, abs) = self.new_blob_path();
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }

        let assemble = async {
            let mut out = File::create(&abs).await?;
            let mut digest = md5::Context::new();
            let mut size_bytes: i64 = 0;
            for part in parts {
                let part_path = dir.join(format!("{:05}.part", part.part_number));
                let chunk = match fs::read(&part_path).await {
                    Ok(chunk) => chunk,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(StoreError::MissingPart {
                            upload_id: upload_id.to_string(),
                            part_number: part.part_number,
                        });
                    }
                    Err(err) => return Err(StoreError::Io(err)),
                };
                if format!("{:x}", md5::compute(&chunk)) != part.etag {
                    return Err(StoreError::MissingPart {
                        upload_id: upload_id.to_string(),
                        part_number: part.part_number,
                    });
                }
                size_bytes += chunk.len() as i64;
                digest.consume(&chunk);
                out.write_all(&chunk).await?;
            }
            out.sync_all().await?;
            Ok((size_bytes, format!("{:x}", digest.compute())))
        };

        let (size_bytes, etag) = match assemble.await {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&abs).await;
                return Err(err);
            }
        };

        if let Err(err) = self.upsert_object(key, &rel, size_bytes, None, &etag).await {
            let _ = fs::remove_file(&abs).await;
            return Err(err);
        }
        if let Some(old) = previous {
            self.discard_blob(&old).await;
        }
        let _ = fs::remove_dir_all(&dir).await;
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str, _key: &str) -> StoreResult<()> {
        match fs::remove_dir_all(self.staging_dir(upload_id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

/// Escape `%`, `_` and `\` so a key prefix matches literally under LIKE.
fn like_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
