//! Defines routes for all file operations.
//!
//! ## Structure
//! - **File endpoints**
//!   - `POST   /files`         -> upload (multipart, field `file`)
//!   - `GET    /files/{token}` -> download
//!   - `DELETE /files/{token}` -> delete (owner only)
//!
//! - **User endpoints**
//!   - `GET    /users/{id}/files` -> list a user's uploads
//!
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        file_handlers::{delete_file, get_file, list_user_files, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all routes.
///
/// The router carries shared state (`FileService`) to all handlers.
/// Upload bodies are capped at `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<FileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/files",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/files/{token}", get(get_file).delete(delete_file))
        .route("/users/{id}/files", get(list_user_files))
}
