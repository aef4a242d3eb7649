//! Liveness endpoint.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::AppState;

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process serves requests.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Storage backend kind.
    pub backend: &'static str,
    /// Container served by this instance.
    pub container: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        backend: state.storage.config().provider_name(),
        container: state.storage.container().to_string(),
    })
}

/// `GET /health`
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
