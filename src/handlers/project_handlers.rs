//! HTTP handlers for project uploads and lookups.
//! Archive downloads are streamed; all storage concerns live in `ProjectRegistry`.

use crate::{
    errors::AppError,
    services::{blob_store::ByteStream, project_registry::ProjectRegistry},
};
use axum::{
    Extension, Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio_util::io::ReaderStream;

/// Largest accepted upload body, in bytes.
#[derive(Clone, Copy, Debug)]
pub struct UploadLimit(pub usize);

/// `POST /projects` — the request body is the raw archive.
///
/// The body is streamed straight into blob staging; it is never buffered
/// whole in memory.
pub async fn create_project(
    State(registry): State<ProjectRegistry>,
    Extension(UploadLimit(limit)): Extension<UploadLimit>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(payload_too_large(limit));
    }

    let mut chunks = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    // Skip leading empty frames so an empty body can be refused up front.
    let first = loop {
        match chunks.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => break chunk,
            Some(Err(err)) => {
                return Err(AppError::bad_request(format!(
                    "failed to read request body: {}",
                    err
                )));
            }
            None => return Err(AppError::bad_request("request body must contain an archive")),
        }
    };

    let exceeded = Arc::new(AtomicBool::new(false));
    let upload = limit_stream(
        stream::once(async move { Ok::<_, io::Error>(first) }).chain(chunks),
        limit,
        exceeded.clone(),
    );

    let project = match registry.create_from_stream(upload).await {
        Ok(project) => project,
        Err(_) if exceeded.load(Ordering::SeqCst) => return Err(payload_too_large(limit)),
        Err(err) => return Err(err.into()),
    };

    let mut response = (StatusCode::CREATED, Json(&project)).into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/projects/{}", project.identifier)) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// Fail the stream once more than `limit` bytes have passed through it.
fn limit_stream<S>(chunks: S, limit: usize, exceeded: Arc<AtomicBool>) -> ByteStream
where
    S: futures::Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut seen: usize = 0;
    Box::pin(chunks.map(move |chunk| {
        let chunk = chunk?;
        seen = seen.saturating_add(chunk.len());
        if seen > limit {
            exceeded.store(true, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upload exceeds size limit",
            ));
        }
        Ok(chunk)
    }))
}

fn payload_too_large(limit: usize) -> AppError {
    AppError::new(
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("upload exceeds {} bytes", limit),
    )
}

/// `GET /projects/{identifier}` — project metadata as JSON.
pub async fn get_project(
    State(registry): State<ProjectRegistry>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    match registry.get(&identifier).await? {
        Some(project) => Ok(Json(project)),
        None => Err(AppError::not_found(format!(
            "project `{}` not found",
            identifier
        ))),
    }
}

/// `GET /projects/{identifier}/archive` — stream the stored archive.
pub async fn download_archive(
    State(registry): State<ProjectRegistry>,
    Path(identifier): Path<String>,
) -> Result<Response, AppError> {
    let (project, reader) = registry.open_archive(&identifier).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    let filename = project
        .storage_key
        .unwrap_or_else(|| format!("{}.zip", project.identifier));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
