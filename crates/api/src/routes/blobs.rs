//! Signed-link gateway for the local storage backends.
//!
//! Download links issued against a `local_fs` or `memory` backend point here
//! (`BlobEndpoint` must be `{public base URL}/blob`). The SAS is verified
//! before any byte is served.

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use abacus_core::storage::SasQuery;

use crate::AppState;
use crate::extractors::RequestCancellation;
use crate::middleware::ApiError;

/// `GET /blob/{container}/{*name}?{sas}`
pub fn routes() -> Router<AppState> {
    Router::new().route("/blob/{container}/{*name}", get(read_blob))
}

async fn read_blob(
    State(state): State<AppState>,
    Path((container, name)): Path<(String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
    cancel: RequestCancellation,
) -> Result<Response, ApiError> {
    let query = SasQuery::from_pairs(pairs);
    let object = state
        .storage
        .read_signed(&container, &name, &query, cancel.token())
        .await?;

    let content_type = object
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_LENGTH, object.content_length.to_string()),
    ];
    Ok((headers, Body::from_stream(object.content)).into_response())
}
