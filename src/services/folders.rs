//! Folder-level operations over a flat key space.
//!
//! A "folder" is nothing but a key prefix ending in `/`: an explicit
//! zero-byte marker written by `create_folder`, or implied by deeper keys.
//! Every operation here decomposes into paginated gateway calls. None of
//! them is atomic; moves are copy-then-delete, so a crash between the phases
//! leaves duplicates rather than losing data.

use crate::errors::{DriveError, DriveResult};
use crate::models::entry::{FileEntry, FolderEntry, FolderListing, format_size};
use crate::services::gateway::Gateway;
use crate::services::keys;
use crate::store::{FailedDelete, ObjectRecord};
use bytes::Bytes;
use std::collections::BTreeSet;
use tracing::debug;

/// Result of a recursive delete. Failures are per-key and reported, not
/// silently dropped; keys deleted before a failure stay deleted.
#[derive(Debug, Default)]
pub struct DeleteSummary {
    pub deleted: usize,
    pub failed: Vec<FailedDelete>,
}

/// Result of a move. Every copied object exists at the destination; `failed`
/// lists source keys that could not be removed afterwards and therefore
/// still exist as duplicates.
#[derive(Debug, Default)]
pub struct MoveSummary {
    pub copied: usize,
    pub failed: Vec<FailedDelete>,
}

#[derive(Clone)]
pub struct FolderTree {
    gateway: Gateway,
}

impl FolderTree {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// One level of the tree: subfolders from delimiter grouping (explicit
    /// markers and implied prefixes alike), files from direct children. The
    /// folder's own marker never shows up as a file.
    pub async fn list_children(&self, tenant: &str, folder: &str) -> DriveResult<FolderListing> {
        let prefix = keys::folder_key(tenant, folder)?;

        let mut folder_keys = BTreeSet::new();
        let mut files = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .gateway
                .list_page(&prefix, Some("/"), token.as_deref())
                .await?;
            folder_keys.extend(page.common_prefixes);
            for record in page.objects {
                if record.key == prefix || record.key.ends_with('/') {
                    continue;
                }
                files.push(file_entry(record));
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let folders = folder_keys
            .into_iter()
            .map(|key| FolderEntry {
                name: last_segment(&key).to_string(),
                key,
            })
            .collect();

        Ok(FolderListing { folders, files })
    }

    /// Materialize a folder as a zero-byte marker object. Idempotent.
    pub async fn create_folder(&self, tenant: &str, folder: &str) -> DriveResult<String> {
        let prefix = keys::folder_key(tenant, folder)?;
        if prefix == keys::tenant_root(tenant)? {
            return Err(DriveError::InvalidPath("folder name required".into()));
        }
        self.gateway.put(&prefix, Bytes::new(), None).await?;
        Ok(prefix)
    }

    /// Delete everything under `folder`, page by page. Each listing page
    /// becomes one chunked batch delete. An empty or absent folder is a
    /// successful no-op, which also makes repeated deletes safe.
    pub async fn delete_recursive(&self, tenant: &str, folder: &str) -> DriveResult<DeleteSummary> {
        let prefix = keys::folder_key(tenant, folder)?;
        let mut summary = DeleteSummary::default();
        let mut token: Option<String> = None;
        loop {
            let page = self.gateway.list_page(&prefix, None, token.as_deref()).await?;
            if !page.objects.is_empty() {
                let keys: Vec<String> =
                    page.objects.into_iter().map(|record| record.key).collect();
                let outcome = self.gateway.delete_batch(&keys).await;
                summary.deleted += outcome.deleted.len();
                summary.failed.extend(outcome.failed);
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(prefix, deleted = summary.deleted, failed = summary.failed.len(), "recursive delete finished");
        Ok(summary)
    }

    /// Copy every object under `src` to the same suffix under `dst`.
    /// Zero matching objects is a successful no-op.
    pub async fn copy_recursive(&self, tenant: &str, src: &str, dst: &str) -> DriveResult<usize> {
        let (src_prefix, dst_prefix) = self.tree_endpoints(tenant, src, dst)?;
        let copied = self.copy_tree(&src_prefix, &dst_prefix).await?;
        Ok(copied.len())
    }

    /// Move a folder: copy the whole tree, then delete the copied originals.
    /// Not atomic; a failure after the copy phase leaves both trees in
    /// place, never neither. Source keys whose delete failed are reported in
    /// the summary, never dropped.
    pub async fn move_recursive(
        &self,
        tenant: &str,
        src: &str,
        dst: &str,
    ) -> DriveResult<MoveSummary> {
        let (src_prefix, dst_prefix) = self.tree_endpoints(tenant, src, dst)?;
        let copied = self.copy_tree(&src_prefix, &dst_prefix).await?;
        let outcome = self.gateway.delete_batch(&copied).await;
        Ok(MoveSummary {
            copied: copied.len(),
            failed: outcome.failed,
        })
    }

    pub async fn copy_file(&self, tenant: &str, src: &str, dst: &str) -> DriveResult<()> {
        let source_key = keys::object_key(tenant, src)?;
        let dest_key = keys::object_key(tenant, dst)?;
        self.gateway.copy(&source_key, &dest_key).await?;
        Ok(())
    }

    pub async fn move_file(&self, tenant: &str, src: &str, dst: &str) -> DriveResult<()> {
        let source_key = keys::object_key(tenant, src)?;
        let dest_key = keys::object_key(tenant, dst)?;
        self.gateway.copy(&source_key, &dest_key).await?;
        self.gateway.delete(&source_key).await?;
        Ok(())
    }

    /// Dispatch on the path shape: a trailing slash means a folder tree.
    pub async fn copy_path(&self, tenant: &str, src: &str, dst: &str) -> DriveResult<()> {
        if src.ends_with('/') {
            self.copy_recursive(tenant, src, dst).await?;
        } else {
            self.copy_file(tenant, src, dst).await?;
        }
        Ok(())
    }

    /// Move or rename; renaming is just a move to a different leaf name.
    pub async fn move_path(&self, tenant: &str, src: &str, dst: &str) -> DriveResult<MoveSummary> {
        if src.ends_with('/') {
            self.move_recursive(tenant, src, dst).await
        } else {
            self.move_file(tenant, src, dst).await?;
            Ok(MoveSummary {
                copied: 1,
                failed: Vec::new(),
            })
        }
    }

    pub async fn delete_file(&self, tenant: &str, path: &str) -> DriveResult<()> {
        let key = keys::object_key(tenant, path)?;
        self.gateway.delete(&key).await?;
        Ok(())
    }

    /// All content-bearing objects under a folder, markers filtered out.
    /// Fails with `EmptyOrMissingFolder` when nothing remains — a consumer
    /// asking for an archive of nothing gets an error, not an empty zip.
    pub async fn folder_objects(
        &self,
        tenant: &str,
        folder: &str,
    ) -> DriveResult<(String, Vec<ObjectRecord>)> {
        let prefix = keys::folder_key(tenant, folder)?;
        let mut objects = self.collect_all(&prefix).await?;
        objects.retain(|record| !record.key.ends_with('/'));
        if objects.is_empty() {
            return Err(DriveError::EmptyOrMissingFolder(folder.to_string()));
        }
        Ok((prefix, objects))
    }

    fn tree_endpoints(
        &self,
        tenant: &str,
        src: &str,
        dst: &str,
    ) -> DriveResult<(String, String)> {
        let src_prefix = keys::folder_key(tenant, src)?;
        let dst_prefix = keys::folder_key(tenant, dst)?;
        if dst_prefix.starts_with(&src_prefix) {
            return Err(DriveError::InvalidPath(
                "destination folder is inside the source".into(),
            ));
        }
        Ok((src_prefix, dst_prefix))
    }

    /// Full delimiter-free enumeration under `prefix`, across all pages.
    async fn collect_all(&self, prefix: &str) -> DriveResult<Vec<ObjectRecord>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.gateway.list_page(prefix, None, token.as_deref()).await?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    /// Copy phase shared by copy/move. Destination keys substitute the
    /// source prefix. Returns the source keys actually copied, in listing
    /// order; a terminal copy failure propagates with earlier copies kept.
    async fn copy_tree(&self, src_prefix: &str, dst_prefix: &str) -> DriveResult<Vec<String>> {
        let mut copied = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .gateway
                .list_page(src_prefix, None, token.as_deref())
                .await?;
            for record in page.objects {
                let suffix = record
                    .key
                    .strip_prefix(src_prefix)
                    .unwrap_or(record.key.as_str());
                let dest_key = format!("{dst_prefix}{suffix}");
                self.gateway.copy(&record.key, &dest_key).await?;
                copied.push(record.key);
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(copied)
    }
}

fn file_entry(record: ObjectRecord) -> FileEntry {
    FileEntry {
        name: last_segment(&record.key).to_string(),
        size_bytes: record.size_bytes,
        size: format_size(record.size_bytes),
        last_modified: record.last_modified,
        key: record.key,
    }
}

fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or(key)
}
