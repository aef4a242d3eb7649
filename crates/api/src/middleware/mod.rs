//! Request middleware.
//!
//! Applied outermost first:
//! 1. `SetRequestIdLayer` / `PropagateRequestIdLayer` with [`CORRELATION_ID_HEADER`]
//! 2. `TraceLayer` with [`request_span`] and [`log_response`]
//! 3. [`error_envelope`], turning handler errors into JSON bodies

mod correlation;
mod error;

pub use correlation::{CORRELATION_ID_HEADER, correlation_id, log_response, request_span};
pub use error::{ApiError, ErrorBody, error_envelope};
