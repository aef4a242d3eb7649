//! Correlation id and request logging.

use std::time::Duration;

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName};
use axum::response::Response;
use tracing::{Span, info, info_span};

/// Header carrying the correlation id, read from the request or generated.
pub static CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

/// Correlation id of a request, or `-` when none is set.
#[must_use]
pub fn correlation_id(headers: &HeaderMap) -> &str {
    headers
        .get(&CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

/// Span wrapping one request.
pub fn request_span(request: &Request) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        correlation_id = %correlation_id(request.headers()),
    )
}

/// Logs status and latency once the response is ready.
pub fn log_response(response: &Response, latency: Duration, _span: &Span) {
    info!(
        status = response.status().as_u16(),
        latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        "Request completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_correlation_id_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(correlation_id(&headers), "-");

        headers.insert(&CORRELATION_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(correlation_id(&headers), "abc-123");
    }
}
