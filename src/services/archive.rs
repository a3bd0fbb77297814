//! Streaming zip assembly.
//!
//! Objects are pulled from the store chunk by chunk and fed straight into
//! the archive writer; no object is ever materialized whole in memory and
//! nothing is buffered to disk. Entry names are the keys relative to the
//! folder root. A failed read of any single object fails the whole archive:
//! a truncated zip is worse than no zip.

use crate::errors::{DriveError, DriveResult};
use crate::services::gateway::Gateway;
use crate::store::ObjectRecord;
use async_zip::{Compression, ZipEntryBuilder};
use async_zip::tokio::write::ZipFileWriter;
use futures::StreamExt;
use futures::io::AsyncWriteExt;
use tokio::io::AsyncWrite;
use tracing::debug;

#[derive(Clone)]
pub struct Archiver {
    gateway: Gateway,
}

impl Archiver {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Stream every object in `objects` into a zip written to `sink`.
    /// Entries are named by stripping `prefix` from each key. The archive is
    /// finalized only after every entry is fully written. Returns the total
    /// uncompressed byte count.
    pub async fn write_folder<W>(
        &self,
        prefix: &str,
        objects: &[ObjectRecord],
        sink: W,
    ) -> DriveResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut zip = ZipFileWriter::with_tokio(sink);
        let mut total: u64 = 0;

        for record in objects {
            let name = record.key.strip_prefix(prefix).unwrap_or(&record.key);
            if name.is_empty() || name.ends_with('/') {
                continue;
            }

            let builder = ZipEntryBuilder::new(name.to_string().into(), Compression::Deflate);
            let mut entry = zip
                .write_entry_stream(builder)
                .await
                .map_err(|err| DriveError::Archive(err.to_string()))?;

            let mut body = self.gateway.get(&record.key).await?;
            while let Some(chunk) = body.next().await {
                let chunk =
                    chunk.map_err(|err| DriveError::Archive(format!("read of `{}`: {err}", record.key)))?;
                entry
                    .write_all(&chunk)
                    .await
                    .map_err(|err| DriveError::Archive(err.to_string()))?;
                total += chunk.len() as u64;
            }
            entry
                .close()
                .await
                .map_err(|err| DriveError::Archive(err.to_string()))?;
        }

        zip.close()
            .await
            .map_err(|err| DriveError::Archive(err.to_string()))?;
        debug!(prefix, entries = objects.len(), total, "archive finalized");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::folders::FolderTree;
    use crate::services::gateway::RetryPolicy;
    use crate::store::{MemoryStore, ObjectStore};
    use crate::test_support::FlakyStore;
    use bytes::Bytes;
    use std::sync::Arc;

    fn harness() -> (Arc<MemoryStore>, Arc<FlakyStore>, FolderTree, Archiver) {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let gateway = Gateway::new(flaky.clone(), RetryPolicy::no_backoff());
        (memory, flaky, FolderTree::new(gateway.clone()), Archiver::new(gateway))
    }

    async fn read_archive(
        bytes: Vec<u8>,
    ) -> async_zip::base::read::seek::ZipFileReader<futures::io::Cursor<Vec<u8>>> {
        async_zip::base::read::seek::ZipFileReader::new(futures::io::Cursor::new(bytes))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn zips_a_folder_with_relative_entry_names_and_sizes() {
        let (memory, _flaky, tree, archiver) = harness();
        memory
            .put("users/u1/photos/a.jpg", Bytes::from_static(&[1u8; 10]), None)
            .await
            .unwrap();
        memory
            .put("users/u1/photos/b.jpg", Bytes::from_static(&[2u8; 20]), None)
            .await
            .unwrap();

        let (prefix, objects) = tree.folder_objects("u1", "photos").await.unwrap();
        let mut sink = std::io::Cursor::new(Vec::new());
        let total = archiver.write_folder(&prefix, &objects, &mut sink).await.unwrap();
        assert_eq!(total, 30);

        let mut reader = read_archive(sink.into_inner()).await;
        let entries = reader.file().entries();
        assert_eq!(entries.len(), 2);
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.filename().as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
        let uncompressed: u64 = reader.file().entries().iter().map(|e| e.uncompressed_size()).sum();
        assert_eq!(uncompressed, 30);

        // Round-trip one entry's bytes.
        let index = reader
            .file()
            .entries()
            .iter()
            .position(|e| e.filename().as_str().unwrap() == "b.jpg")
            .unwrap();
        let mut entry_reader = reader.reader_with_entry(index).await.unwrap();
        let mut body = Vec::new();
        futures::AsyncReadExt::read_to_end(&mut entry_reader, &mut body).await.unwrap();
        assert_eq!(body, vec![2u8; 20]);
    }

    #[tokio::test]
    async fn nested_keys_keep_their_relative_paths() {
        let (memory, _flaky, tree, archiver) = harness();
        memory
            .put("users/u1/docs/2024/notes.txt", Bytes::from_static(b"n"), None)
            .await
            .unwrap();
        memory.put("users/u1/docs/top.txt", Bytes::from_static(b"t"), None).await.unwrap();

        let (prefix, objects) = tree.folder_objects("u1", "docs").await.unwrap();
        let mut sink = std::io::Cursor::new(Vec::new());
        archiver.write_folder(&prefix, &objects, &mut sink).await.unwrap();

        let reader = read_archive(sink.into_inner()).await;
        let mut names: Vec<String> = reader
            .file()
            .entries()
            .iter()
            .map(|e| e.filename().as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["2024/notes.txt", "top.txt"]);
    }

    #[tokio::test]
    async fn one_unreadable_object_fails_the_whole_archive() {
        let (memory, flaky, tree, archiver) = harness();
        memory.put("users/u1/photos/a.jpg", Bytes::from_static(b"aaaa"), None).await.unwrap();
        memory.put("users/u1/photos/b.jpg", Bytes::from_static(b"bbbb"), None).await.unwrap();
        flaky.fail_gets_for("users/u1/photos/b.jpg");

        let (prefix, objects) = tree.folder_objects("u1", "photos").await.unwrap();
        let mut sink = std::io::Cursor::new(Vec::new());
        let err = archiver.write_folder(&prefix, &objects, &mut sink).await.unwrap_err();
        assert!(matches!(
            err,
            DriveError::StoreUnavailable(_) | DriveError::Archive(_)
        ));
    }
}
