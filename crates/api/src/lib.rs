//! HTTP API layer with Axum routes and middleware.
//!
//! This crate provides:
//! - File routes translating 1:1 onto the storage facade
//! - A signed-link gateway for local storage backends
//! - Correlation id, request logging and error envelope middleware

pub mod extractors;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use abacus_core::storage::StorageService;

use crate::middleware::{CORRELATION_ID_HEADER, error_envelope, log_response, request_span};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Storage facade for the configured container.
    pub storage: Arc<StorageService>,
    /// Cancelled on server shutdown; each request runs on a child token.
    pub shutdown: CancellationToken,
    /// Largest accepted upload request body.
    pub max_upload_bytes: usize,
}

/// Creates the main application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::api_routes(&state))
        .layer(axum::middleware::from_fn(error_envelope))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_response(log_response),
        )
        .layer(PropagateRequestIdLayer::new(CORRELATION_ID_HEADER.clone()))
        .layer(SetRequestIdLayer::new(CORRELATION_ID_HEADER.clone(), MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
