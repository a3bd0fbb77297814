//! Upload-history catalog.
//!
//! Keeps a row per committed upload so tenants can see what they stored and
//! when. Writes are fire-and-forget from the coordinator's point of view: a
//! catalog failure is logged and never rolls back the upload itself.

use crate::models::history::UploadRecord;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct HistoryCatalog {
    db: Arc<SqlitePool>,
}

impl HistoryCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn record(&self, record: &UploadRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO upload_history (id, tenant, key, size_bytes, etag, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.tenant)
        .bind(&record.key)
        .bind(record.size_bytes)
        .bind(&record.etag)
        .bind(record.uploaded_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn recent_for_tenant(
        &self,
        tenant: &str,
        limit: i64,
    ) -> Result<Vec<UploadRecord>, sqlx::Error> {
        sqlx::query_as::<_, UploadRecord>(
            "SELECT id, tenant, key, size_bytes, etag, uploaded_at
             FROM upload_history
             WHERE tenant = ?
             ORDER BY uploaded_at DESC
             LIMIT ?",
        )
        .bind(tenant)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&*self.db)
        .await
    }
}
