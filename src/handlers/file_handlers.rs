//! HTTP handlers for the tenant file drive.
//!
//! Thin layer over the services: extract the tenant, decode the request,
//! delegate, shape the JSON. The one exception is the archive download,
//! which wires the zip writer to the response body through an in-process
//! duplex pipe so nothing is buffered.

use crate::{
    AppState,
    errors::AppError,
    models::upload::UploadOutcome,
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tracing::error;

const ARCHIVE_PIPE_BUF: usize = 64 * 1024;

/// Tenant identity, supplied by the authenticating proxy in `X-Tenant-Id`.
/// Credential validation happens upstream; this layer only requires the
/// header to be present.
pub struct TenantId(pub String);

impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-tenant-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| TenantId(value.to_string()))
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing X-Tenant-Id header"))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderReq {
    pub folder_path: String,
    pub current_folder: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteReq {
    pub key: String,
    #[serde(default)]
    pub is_folder: bool,
}

#[derive(Debug, Deserialize)]
pub struct CopyMoveReq {
    pub source_key: String,
    pub destination_key: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameReq {
    pub old_key: String,
    pub new_key: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// POST `/files/upload` — multipart form with repeated `files` fields and an
/// optional `folder` text field. Files upload concurrently and each gets an
/// independent result; one failure never fails the batch.
pub async fn upload_files(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut folder = String::new();
    let mut files: Vec<(String, Option<String>, Bytes)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        if name.as_deref() == Some("folder") {
            folder = field
                .text()
                .await
                .map_err(|err| AppError::bad_request(err.to_string()))?;
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let payload = field
            .bytes()
            .await
            .map_err(|err| AppError::bad_request(err.to_string()))?;
        files.push((filename, content_type, payload));
    }

    if files.is_empty() {
        return Err(AppError::bad_request("no files uploaded"));
    }

    let mut tasks = JoinSet::new();
    for (filename, content_type, payload) in files {
        let uploads = state.uploads.clone();
        let tenant = tenant.clone();
        let folder = folder.clone();
        tasks.spawn(async move {
            match uploads
                .upload(&tenant, &folder, &filename, content_type.as_deref(), payload)
                .await
            {
                Ok(stored) => UploadOutcome::ok(filename, stored),
                Err(err) => UploadOutcome::failed(filename, err.to_string()),
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.map_err(|err| AppError::internal(err.to_string()))?);
    }

    Ok((
        StatusCode::OK,
        Json(json!({ "message": "files uploaded", "results": results })),
    )
        .into_response())
}

/// POST `/files/folder` — create a folder marker, optionally nested under
/// the caller's current folder.
pub async fn create_folder(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Json(req): Json<CreateFolderReq>,
) -> Result<Response, AppError> {
    if req.folder_path.is_empty() {
        return Err(AppError::bad_request("folder path required"));
    }
    let relative = match req.current_folder.as_deref() {
        Some(current) if !current.is_empty() => format!("{current}/{}", req.folder_path),
        _ => req.folder_path.clone(),
    };
    let key = state.folders.create_folder(&tenant, &relative).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "folder created", "key": key })),
    )
        .into_response())
}

/// GET `/files/list?prefix=` — one level of folders and files.
pub async fn list_files(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let listing = state
        .folders
        .list_children(&tenant, query.prefix.as_deref().unwrap_or(""))
        .await?;
    Ok(Json(listing).into_response())
}

/// DELETE `/files` — delete a single file or a whole folder tree.
pub async fn delete_entry(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Json(req): Json<DeleteReq>,
) -> Result<Response, AppError> {
    if req.key.is_empty() {
        return Err(AppError::bad_request("key is required"));
    }
    if req.is_folder {
        let summary = state.folders.delete_recursive(&tenant, &req.key).await?;
        Ok(Json(json!({
            "message": "folder deleted",
            "deleted": summary.deleted,
            "failed": failed_json(&summary.failed),
        }))
        .into_response())
    } else {
        state.folders.delete_file(&tenant, &req.key).await?;
        Ok(Json(json!({ "message": "file deleted" })).into_response())
    }
}

/// POST `/files/copy` — copy a file, or a folder tree when the source key
/// ends in `/`.
pub async fn copy_entry(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Json(req): Json<CopyMoveReq>,
) -> Result<Response, AppError> {
    require_keys(&req.source_key, &req.destination_key)?;
    state
        .folders
        .copy_path(&tenant, &req.source_key, &req.destination_key)
        .await?;
    Ok(Json(json!({ "message": "copied successfully" })).into_response())
}

/// POST `/files/move` — copy-then-delete; not atomic, duplication-biased.
/// Source keys whose delete failed are reported so the caller can see the
/// duplicates left behind.
pub async fn move_entry(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Json(req): Json<CopyMoveReq>,
) -> Result<Response, AppError> {
    require_keys(&req.source_key, &req.destination_key)?;
    let summary = state
        .folders
        .move_path(&tenant, &req.source_key, &req.destination_key)
        .await?;
    Ok(Json(json!({
        "message": "moved successfully",
        "moved": summary.copied,
        "failed": failed_json(&summary.failed),
    }))
    .into_response())
}

/// POST `/files/rename` — a rename is a move with a new leaf name.
pub async fn rename_entry(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Json(req): Json<RenameReq>,
) -> Result<Response, AppError> {
    require_keys(&req.old_key, &req.new_key)?;
    let summary = state
        .folders
        .move_path(&tenant, &req.old_key, &req.new_key)
        .await?;
    Ok(Json(json!({
        "message": "renamed successfully",
        "moved": summary.copied,
        "failed": failed_json(&summary.failed),
    }))
    .into_response())
}

/// GET `/files/history?limit=` — recent catalogued uploads for the tenant.
pub async fn upload_history(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, AppError> {
    let records = state
        .history
        .recent_for_tenant(&tenant, query.limit.unwrap_or(50))
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    Ok(Json(json!({ "uploads": records })).into_response())
}

/// GET `/files/download/{*folder}` — stream the folder as a zip attachment.
///
/// The archive is written into one end of a duplex pipe while the response
/// streams the other end. A writer failure is forwarded into the body
/// stream after the pipe drains, so the response aborts mid-transfer
/// instead of ending on a clean EOF that looks like a complete zip.
pub async fn download_folder(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(folder): Path<String>,
) -> Result<Response, AppError> {
    let (prefix, objects) = state.folders.folder_objects(&tenant, &folder).await?;

    let archive_name = folder
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("folder")
        .to_string();

    let (writer, reader) = tokio::io::duplex(ARCHIVE_PIPE_BUF);
    let (err_tx, err_rx) = tokio::sync::oneshot::channel::<io::Error>();
    let archiver = state.archiver.clone();
    tokio::spawn(async move {
        if let Err(err) = archiver.write_folder(&prefix, &objects, writer).await {
            error!(prefix, "archive stream failed: {err}");
            let _ = err_tx.send(io::Error::other(err.to_string()));
        }
    });

    let tail = futures::stream::once(async move {
        match err_rx.await {
            Ok(err) => Some(Err(err)),
            // Sender dropped without an error: the archive finished cleanly.
            Err(_) => None,
        }
    })
    .filter_map(futures::future::ready);
    let body = Body::from_stream(ReaderStream::new(reader).chain(tail));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if let Ok(value) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{archive_name}.zip\""
    )) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn require_keys(a: &str, b: &str) -> Result<(), AppError> {
    if a.is_empty() || b.is_empty() {
        return Err(AppError::bad_request("source and destination keys are required"));
    }
    Ok(())
}

fn failed_json(failed: &[crate::store::FailedDelete]) -> Vec<serde_json::Value> {
    failed
        .iter()
        .map(|f| json!({ "key": f.key, "reason": f.reason }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use crate::services::archive::Archiver;
    use crate::services::folders::FolderTree;
    use crate::services::gateway::{Gateway, RetryPolicy};
    use crate::services::history::HistoryCatalog;
    use crate::services::multipart::UploadCoordinator;
    use crate::store::local::apply_schema;
    use crate::store::{MemoryStore, ObjectStore};
    use crate::test_support::FlakyStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn test_state() -> (Arc<MemoryStore>, Arc<FlakyStore>, AppState) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        let db = Arc::new(pool);

        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let gateway = Gateway::new(flaky.clone(), RetryPolicy::no_backoff());
        let history = HistoryCatalog::new(db.clone());
        let state = AppState {
            folders: FolderTree::new(gateway.clone()),
            uploads: UploadCoordinator::new(gateway.clone(), 8 * 1024 * 1024, 4, Some(history.clone())),
            archiver: Archiver::new(gateway.clone()),
            history,
            gateway,
            db,
        };
        (memory, flaky, state)
    }

    #[tokio::test]
    async fn download_streams_a_complete_zip_attachment() {
        let (memory, _flaky, state) = test_state().await;
        memory
            .put("users/u1/photos/a.jpg", Bytes::from_static(b"aaaa"), None)
            .await
            .unwrap();

        let response = download_folder(
            State(state),
            TenantId("u1".into()),
            Path("photos".into()),
        )
        .await
        .unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/zip"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // Local-file header magic of a non-empty zip.
        assert!(bytes.starts_with(b"PK\x03\x04"));
    }

    #[tokio::test]
    async fn download_body_errors_when_an_object_read_fails_mid_stream() {
        let (memory, flaky, state) = test_state().await;
        memory
            .put("users/u1/photos/a.jpg", Bytes::from_static(b"aaaa"), None)
            .await
            .unwrap();
        memory
            .put("users/u1/photos/b.jpg", Bytes::from_static(b"bbbb"), None)
            .await
            .unwrap();
        flaky.fail_gets_for("users/u1/photos/b.jpg");

        let response = download_folder(
            State(state),
            TenantId("u1".into()),
            Path("photos".into()),
        )
        .await
        .unwrap();

        // The body must surface the failure instead of ending cleanly with
        // a truncated archive.
        let collected = axum::body::to_bytes(response.into_body(), usize::MAX).await;
        assert!(collected.is_err());
    }
}
