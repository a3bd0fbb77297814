//! Defines routes for the tenant file drive.
//!
//! ## Structure
//! - **File endpoints** (all require `X-Tenant-Id`)
//!   - `POST   /files/upload` — multipart form upload, one or more files
//!   - `POST   /files/folder` — create a folder
//!   - `GET    /files/list` — list one folder level (supports prefix)
//!   - `DELETE /files` — delete a file or folder tree
//!   - `POST   /files/copy` — copy a file or folder
//!   - `POST   /files/move` — move a file or folder
//!   - `POST   /files/rename` — rename a file or folder
//!   - `GET    /files/history` — recent uploads for the tenant
//!   - `GET    /files/download/{*folder}` — stream a folder as a zip
//!
//! The wildcard `*folder` allows nested folders like `photos/2025/trip`.

use crate::{
    AppState,
    handlers::{
        file_handlers::{
            copy_entry, create_folder, delete_entry, download_folder, list_files, move_entry,
            rename_entry, upload_files, upload_history,
        },
        health_handlers::{healthz, readyz},
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Uploads arrive as buffered multipart bodies; allow up to 1 GiB per request.
const MAX_UPLOAD_BODY: usize = 1024 * 1024 * 1024;

/// Build and return the router for the whole file drive API.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // file endpoints
        .route(
            "/files/upload",
            post(upload_files).layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY)),
        )
        .route("/files/folder", post(create_folder))
        .route("/files/list", get(list_files))
        .route("/files", delete(delete_entry))
        .route("/files/copy", post(copy_entry))
        .route("/files/move", post(move_entry))
        .route("/files/rename", post(rename_entry))
        .route("/files/history", get(upload_history))
        .route("/files/download/{*folder}", get(download_folder))
}
