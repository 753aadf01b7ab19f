//! Defines routes for project uploads, lookups and probes.
//!
//! - `POST /projects`                      — upload an archive, returns the new project
//! - `GET  /projects/{identifier}`         — project metadata
//! - `GET  /projects/{identifier}/archive` — download the stored archive
//! - `GET  /healthz`, `GET /readyz`        — liveness and readiness

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        project_handlers::{UploadLimit, create_project, download_archive, get_project},
    },
    services::project_registry::ProjectRegistry,
};
use axum::{
    Extension, Router,
    routing::{get, post},
};

/// Build the router. Uploads larger than `max_upload_bytes` are rejected with 413.
pub fn routes(max_upload_bytes: usize) -> Router<ProjectRegistry> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/projects",
            post(create_project).layer(Extension(UploadLimit(max_upload_bytes))),
        )
        .route("/projects/{identifier}", get(get_project))
        .route("/projects/{identifier}/archive", get(download_archive))
}
