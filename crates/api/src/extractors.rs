//! Request extractors.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tokio_util::sync::CancellationToken;

use crate::AppState;

/// Per-request cancellation token.
///
/// A child of the server's shutdown token. It is cancelled when dropped, so a
/// handler future abandoned by a disconnecting client stops its storage call.
///
/// ```ignore
/// async fn handler(State(state): State<AppState>, cancel: RequestCancellation) {
///     state.storage.list(cancel.token());
/// }
/// ```
#[derive(Debug)]
pub struct RequestCancellation {
    token: CancellationToken,
}

impl RequestCancellation {
    /// Token to pass to storage calls.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RequestCancellation {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl FromRequestParts<AppState> for RequestCancellation {
    type Rejection = Infallible;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self {
            token: state.shutdown.child_token(),
        })
    }
}
