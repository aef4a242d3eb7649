//! File management routes.
//!
//! | method | path | success |
//! |---|---|---|
//! | GET | `/api/file` | 200, JSON array of encoded names |
//! | GET | `/api/file/{blob_name}` | 200, JSON string with the signed URL |
//! | POST | `/api/file/upload` | 201, `Location` header |
//! | DELETE | `/api/file/{blob_name}` | 204, or 404 with an empty body |

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use tracing::debug;

use abacus_core::storage::{StorageError, encode_name};
use abacus_shared::AppError;

use crate::AppState;
use crate::extractors::RequestCancellation;
use crate::middleware::ApiError;

const FILE_FIELD: &str = "file";
const BLOB_NAME_FIELD: &str = "blobName";

/// Creates the file routes; uploads are limited to `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/api/file", get(list_files))
        .route(
            "/api/file/upload",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route(
            "/api/file/{blob_name}",
            get(download_file).delete(delete_file),
        )
}

/// Query parameters of an upload.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    /// Target name; overrides the form field and the file name.
    pub blob_name: Option<String>,
}

/// GET `/api/file`
async fn list_files(
    State(state): State<AppState>,
    cancel: RequestCancellation,
) -> Result<Json<Vec<String>>, ApiError> {
    let names: Vec<String> = state.storage.list(cancel.token()).try_collect().await?;
    Ok(Json(names))
}

/// GET `/api/file/{blob_name}`
async fn download_file(
    State(state): State<AppState>,
    Path(blob_name): Path<String>,
    cancel: RequestCancellation,
) -> Result<Json<String>, ApiError> {
    let link = state.storage.download(&blob_name, cancel.token()).await?;
    Ok(Json(link.url.to_string()))
}

/// DELETE `/api/file/{blob_name}`
async fn delete_file(
    State(state): State<AppState>,
    Path(blob_name): Path<String>,
    cancel: RequestCancellation,
) -> Result<StatusCode, ApiError> {
    if state.storage.delete(&blob_name, cancel.token()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// POST `/api/file/upload`
///
/// The name comes from the `blobName` query parameter, else a `blobName`
/// field sent before the file part, else the file part's file name. The file
/// part is streamed straight to storage; later parts are not read.
async fn upload_file(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    cancel: RequestCancellation,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, [(HeaderName, String); 1]), ApiError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > state.max_upload_bytes as u64) {
        return Err(AppError::PayloadTooLarge(format!(
            "request body exceeds {} bytes",
            state.max_upload_bytes
        ))
        .into());
    }

    let mut form_name = None;
    while let Some(mut field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(BLOB_NAME_FIELD) => form_name = Some(field.text().await?),
            Some(FILE_FIELD) => {
                let name = [params.blob_name, form_name, field.file_name().map(str::to_string)]
                    .into_iter()
                    .flatten()
                    .map(|n| n.trim().to_string())
                    .find(|n| !n.is_empty())
                    .ok_or_else(|| {
                        AppError::Validation("a blob name or file name is required".to_string())
                    })?;
                let content_type = field.content_type().map(str::to_string);

                let first = loop {
                    match field.chunk().await? {
                        Some(chunk) if chunk.is_empty() => {}
                        Some(chunk) => break chunk,
                        None => {
                            return Err(AppError::Validation("file is empty".to_string()).into());
                        }
                    }
                };

                let limit_hit = AtomicBool::new(false);
                let content = stream::once(async { Ok::<Bytes, io::Error>(first) }).chain(
                    field.map_err(|e| {
                        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                            limit_hit.store(true, Ordering::Relaxed);
                        }
                        io::Error::other(e)
                    }),
                );

                state
                    .storage
                    .upload(&name, content, content_type.as_deref(), cancel.token())
                    .await
                    .map_err(|err| match err {
                        StorageError::Content(_) if limit_hit.load(Ordering::Relaxed) => {
                            ApiError(AppError::PayloadTooLarge(err.to_string()))
                        }
                        other => ApiError::from(other),
                    })?;

                let location = format!("/api/file/{}", encode_name(&name));
                return Ok((StatusCode::CREATED, [(header::LOCATION, location)]));
            }
            other => debug!(field = ?other, "Ignoring form field"),
        }
    }

    Err(AppError::Validation(format!("missing '{FILE_FIELD}' form part")).into())
}
