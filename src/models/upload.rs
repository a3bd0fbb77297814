//! Multipart upload session state and per-file outcomes.

use crate::store::PartEtag;
use serde::Serialize;

/// Lifecycle of one multipart session. A session must never be left `Open`:
/// every exit path ends in `Committed` or `Aborted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Open,
    Completing,
    Committed,
    Aborted,
}

/// Book-keeping for one in-flight multipart upload, owned exclusively by the
/// coordinator driving it.
#[derive(Debug)]
pub struct UploadSession {
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<PartEtag>,
    pub state: UploadState,
}

impl UploadSession {
    pub fn new(upload_id: String, key: String) -> Self {
        Self {
            upload_id,
            key,
            parts: Vec::new(),
            state: UploadState::Open,
        }
    }

    pub fn record_part(&mut self, part: PartEtag) {
        self.parts.push(part);
    }

    /// Sort recorded parts ascending and check they are exactly 1..=expected
    /// with no gaps or duplicates, whatever order the workers finished in.
    pub fn finalize_parts(&mut self, expected: u32) -> bool {
        self.parts.sort_by_key(|part| part.part_number);
        self.parts.len() as u32 == expected
            && self
                .parts
                .iter()
                .zip(1..=expected)
                .all(|(part, number)| part.part_number == number)
    }
}

/// A successfully persisted upload.
#[derive(Clone, Debug, Serialize)]
pub struct StoredUpload {
    pub key: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
}

/// Per-file result reported back to a caller uploading a batch. One file's
/// failure never affects its siblings.
#[derive(Debug, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn ok(filename: String, stored: StoredUpload) -> Self {
        Self {
            filename,
            success: true,
            key: Some(stored.key),
            size_bytes: Some(stored.size_bytes),
            etag: stored.etag,
            error: None,
        }
    }

    pub fn failed(filename: String, error: impl Into<String>) -> Self {
        Self {
            filename,
            success: false,
            key: None,
            size_bytes: None,
            etag: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32) -> PartEtag {
        PartEtag {
            part_number: n,
            etag: format!("etag-{n}"),
        }
    }

    #[test]
    fn finalize_sorts_out_of_order_completions() {
        let mut session = UploadSession::new("id".into(), "k".into());
        for n in [3, 1, 2] {
            session.record_part(part(n));
        }
        assert!(session.finalize_parts(3));
        let numbers: Vec<u32> = session.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn finalize_rejects_gaps_and_duplicates() {
        let mut session = UploadSession::new("id".into(), "k".into());
        session.record_part(part(1));
        session.record_part(part(3));
        assert!(!session.finalize_parts(3));

        let mut session = UploadSession::new("id".into(), "k".into());
        session.record_part(part(1));
        session.record_part(part(1));
        session.record_part(part(2));
        assert!(!session.finalize_parts(3));
    }
}
