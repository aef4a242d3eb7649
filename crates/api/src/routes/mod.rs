//! API route definitions.

use axum::Router;

use crate::AppState;

pub mod blobs;
pub mod files;
pub mod health;

/// Creates the router with all routes.
///
/// The signed-link gateway is only mounted when the storage backend cannot
/// serve links itself.
pub fn api_routes(state: &AppState) -> Router<AppState> {
    let router = Router::new()
        .merge(health::routes())
        .merge(files::routes(state.max_upload_bytes));

    if state.storage.serves_links_locally() {
        router.merge(blobs::routes())
    } else {
        router
    }
}
