//! Defines routes for the file manager JSON API.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Folders**
//!   - `GET    /api/tree`: full folder tree
//!   - `GET    /api/directories?path=`: list/browse (search, file_type, tag, sort, direction)
//!   - `POST   /api/directories`: create folder
//!   - `DELETE /api/directories?path=`: recursive delete
//!   - `POST   /api/directories/rename`, `POST /api/directories/move`
//!
//! - **Files**
//!   - `POST   /api/files`: multipart upload
//!   - `GET    /api/files/download?path=`, `POST /api/files/bundle`
//!   - `POST   /api/files/move`, `/rename`, `/delete`
//!   - `GET|PUT /api/files/metadata`, `GET /api/files/preview?path=`
//!   - `GET    /api/tags`, `GET /api/events` (Server-Sent Events)
//!
//! Every `/api` route requires the `x-tenant-id` header.

use crate::{
    handlers::{
        directory_handlers::{
            browse_directory, create_directory, delete_directory, get_tree, move_directory,
            rename_directory,
        },
        file_handlers::{
            delete_files, download_bundle, download_file, events, get_metadata, list_tags,
            move_files, preview_file, rename_file, save_metadata, upload_files,
        },
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Largest accepted request body, uploads included.
pub const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

/// Build and return the router for the whole API.
///
/// The router carries shared state (`FileService`) to all handlers.
pub fn routes() -> Router<FileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Folder routes
        .route("/api/tree", get(get_tree))
        .route(
            "/api/directories",
            get(browse_directory)
                .post(create_directory)
                .delete(delete_directory),
        )
        .route("/api/directories/rename", post(rename_directory))
        .route("/api/directories/move", post(move_directory))
        // File routes
        .route("/api/files", post(upload_files))
        .route("/api/files/download", get(download_file))
        .route("/api/files/bundle", post(download_bundle))
        .route("/api/files/move", post(move_files))
        .route("/api/files/rename", post(rename_file))
        .route("/api/files/delete", post(delete_files))
        .route("/api/files/metadata", get(get_metadata).put(save_metadata))
        .route("/api/files/preview", get(preview_file))
        .route("/api/tags", get(list_tags))
        .route("/api/events", get(events))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
