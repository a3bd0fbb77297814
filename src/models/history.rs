//! Catalogued record of a completed upload.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// One row of the upload-history catalog. Written fire-and-forget after a
/// successful commit; a failed write never rolls the upload back.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct UploadRecord {
    pub id: Uuid,
    /// Owning tenant.
    pub tenant: String,
    /// Fully qualified object key.
    pub key: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(tenant: &str, key: &str, size_bytes: i64, etag: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            key: key.to_string(),
            size_bytes,
            etag,
            uploaded_at: Utc::now(),
        }
    }
}
