//! Error envelope.
//!
//! Handlers return [`ApiError`]. Its response carries only a status code and an
//! [`ErrorReport`] extension; [`error_envelope`] then writes the JSON body,
//! which needs the correlation id from the request.

use axum::Json;
use axum::extract::Request;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, error, warn};

use abacus_core::storage::StorageError;
use abacus_shared::AppError;

use super::correlation::correlation_id;

/// Handler error, rendered as `{statusCode, message, correlationId}`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

/// JSON body of an error response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// HTTP status code.
    pub status_code: u16,
    /// Human readable message.
    pub message: String,
    /// Correlation id of the failed request.
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
struct ErrorReport {
    code: &'static str,
    detail: String,
    cancelled: bool,
    server_error: bool,
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        let app = match err {
            StorageError::FileExists { .. } => AppError::Conflict(message),
            StorageError::FileNotFound { .. } => AppError::NotFound(message),
            StorageError::InvalidName(_) | StorageError::Content(_) => {
                AppError::Validation(message)
            }
            StorageError::Forbidden(_) => AppError::Forbidden(message),
            StorageError::Cancelled => AppError::Cancelled,
            StorageError::Configuration(_) => AppError::Configuration(message),
            StorageError::Backend(_) => AppError::ExternalService(message),
        };
        Self(app)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        let app = if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(err.body_text())
        } else {
            AppError::Validation(err.body_text())
        };
        Self(app)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = status.into_response();
        response.extensions_mut().insert(ErrorReport {
            code: self.0.error_code(),
            detail: self.0.to_string(),
            cancelled: matches!(self.0, AppError::Cancelled),
            server_error: self.0.is_server_error(),
        });
        response
    }
}

/// Rewrites [`ApiError`] responses into the JSON envelope and logs them.
///
/// 5xx are logged at `error`, 4xx at `warn`, cancellations at `debug`.
/// Responses without an error report pass through untouched.
pub async fn error_envelope(request: Request, next: Next) -> Response {
    let correlation = correlation_id(request.headers()).to_string();
    let mut response = next.run(request).await;

    let Some(report) = response.extensions_mut().remove::<ErrorReport>() else {
        return response;
    };
    let status = response.status();

    let message = if report.cancelled {
        debug!(code = report.code, "Request cancelled");
        report.detail
    } else if report.server_error {
        error!(code = report.code, error = %report.detail, "Request failed");
        "An internal error occurred".to_string()
    } else {
        warn!(code = report.code, error = %report.detail, "Request rejected");
        report.detail
    };

    let body = ErrorBody {
        status_code: status.as_u16(),
        message,
        correlation_id: correlation,
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StorageError::file_exists("a"), 409)]
    #[case(StorageError::file_not_found("a"), 404)]
    #[case(StorageError::InvalidName("".into()), 400)]
    #[case(StorageError::Content("reset".into()), 400)]
    #[case(StorageError::Forbidden("expired".into()), 403)]
    #[case(StorageError::Cancelled, 499)]
    #[case(StorageError::configuration("no key"), 500)]
    #[case(StorageError::backend("timeout"), 500)]
    fn test_storage_error_status(#[case] err: StorageError, #[case] status: u16) {
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status().as_u16(), status);
        assert!(response.extensions().get::<ErrorReport>().is_some());
    }
}
