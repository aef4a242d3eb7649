//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Upload target name already present in the container.
    #[error("file '{name}' already exists")]
    FileExists {
        /// Object name.
        name: String,
    },

    /// Object not found in the container.
    #[error("file '{name}' does not exist")]
    FileNotFound {
        /// Object name.
        name: String,
    },

    /// Object name cannot be stored.
    #[error("invalid file name: {0}")]
    InvalidName(String),

    /// The upload content stream failed before it was fully consumed.
    #[error("failed to read upload content: {0}")]
    Content(String),

    /// Missing or invalid credential, container name, TTL or signing setup.
    #[error("storage configuration error: {0}")]
    Configuration(String),

    /// Signed link rejected.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Backend call failed (network, throttling, unexpected status).
    #[error("storage backend unavailable: {0}")]
    Backend(String),

    /// Cancellation requested while the operation was in flight.
    #[error("storage operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Create a file exists error.
    #[must_use]
    pub fn file_exists(name: impl Into<String>) -> Self {
        Self::FileExists { name: name.into() }
    }

    /// Create a file not found error.
    #[must_use]
    pub fn file_not_found(name: impl Into<String>) -> Self {
        Self::FileNotFound { name: name.into() }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a backend error.
    #[must_use]
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Whether the error was caused by cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<opendal::Error> for StorageError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::ConfigInvalid | opendal::ErrorKind::PermissionDenied => {
                Self::Configuration(err.to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Backend(err.to_string())
    }
}
