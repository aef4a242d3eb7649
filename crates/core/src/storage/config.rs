//! Validated storage configuration.

use std::fmt;

use chrono::Duration;

use abacus_shared::{SigningMode, StorageBackend, StorageSettings};

use super::connection_string::ConnectionString;
use super::error::StorageError;

/// Storage settings after startup validation.
///
/// Built once, never mutated, and handed to [`super::StorageService::connect`].
#[derive(Clone)]
pub struct StorageConfig {
    /// Object store backing the container.
    pub backend: StorageBackend,
    /// Container name.
    pub container: String,
    /// Parsed connection string.
    pub connection: ConnectionString,
    /// Lifetime of issued download links.
    pub token_ttl: Duration,
    /// Which signing strategies may be used.
    pub signing: SigningMode,
    /// Pre-acquired Azure AD token for delegation keys.
    pub bearer_token: Option<String>,
}

impl StorageConfig {
    /// Default link lifetime: 15 minutes.
    pub const DEFAULT_TOKEN_EXPIRY_MINUTES: i64 = 15;

    /// Longest link lifetime: 7 days, the user delegation key limit.
    pub const MAX_TOKEN_EXPIRY_MINUTES: i64 = 7 * 24 * 60;

    /// Create a config with the default TTL and `auto` signing.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the container name or the connection
    /// string is invalid.
    pub fn new(
        backend: StorageBackend,
        container: impl Into<String>,
        connection_string: &str,
    ) -> Result<Self, StorageError> {
        let container = container.into().trim().to_string();
        validate_container_name(&container)?;
        let connection = connection_string.parse()?;

        Ok(Self {
            backend,
            container,
            connection,
            token_ttl: Duration::minutes(Self::DEFAULT_TOKEN_EXPIRY_MINUTES),
            signing: SigningMode::Auto,
            bearer_token: None,
        })
    }

    /// Validate raw settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty or invalid container name,
    /// an unparsable connection string, or a non-positive TTL.
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, StorageError> {
        let ttl = Duration::try_minutes(settings.token_expiry_minutes).ok_or_else(|| {
            StorageError::configuration(format!(
                "token expiry of {} minutes is out of range",
                settings.token_expiry_minutes
            ))
        })?;
        let config = Self::new(
            settings.backend.clone(),
            settings.container.as_str(),
            &settings.connection_string,
        )?
        .with_token_ttl(ttl)
        .with_signing(settings.signing)
        .with_bearer_token(settings.bearer_token.clone());

        config.validate()?;
        Ok(config)
    }

    /// Set the download link lifetime.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Set the signing mode.
    #[must_use]
    pub fn with_signing(mut self, signing: SigningMode) -> Self {
        self.signing = signing;
        self
    }

    /// Set the bearer token used for delegation keys. Blank tokens are ignored.
    #[must_use]
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    /// Check values that builder methods can still invalidate.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the TTL is not positive or exceeds
    /// [`Self::MAX_TOKEN_EXPIRY_MINUTES`].
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.token_ttl <= Duration::zero() {
            return Err(StorageError::configuration(format!(
                "token expiry must be positive, got {} seconds",
                self.token_ttl.num_seconds()
            )));
        }
        if self.token_ttl > Duration::minutes(Self::MAX_TOKEN_EXPIRY_MINUTES) {
            return Err(StorageError::configuration(format!(
                "token expiry must not exceed {} minutes, got {}",
                Self::MAX_TOKEN_EXPIRY_MINUTES,
                self.token_ttl.num_minutes()
            )));
        }
        Ok(())
    }

    /// Backend name for logs.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        match self.backend {
            StorageBackend::AzureBlob => "azure_blob",
            StorageBackend::LocalFs { .. } => "local_fs",
            StorageBackend::Memory => "memory",
        }
    }

    /// Whether signed links are served by this process rather than the storage account.
    #[must_use]
    pub fn serves_links_locally(&self) -> bool {
        !matches!(self.backend, StorageBackend::AzureBlob)
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("container", &self.container)
            .field("connection", &self.connection)
            .field("token_ttl_secs", &self.token_ttl.num_seconds())
            .field("signing", &self.signing)
            .field("bearer_token", &self.bearer_token.is_some())
            .finish()
    }
}

/// Azure container naming rules: 3-63 chars of lowercase letters, digits and
/// single hyphens, starting and ending with a letter or digit.
fn validate_container_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::configuration(
            "storage container name is not configured",
        ));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid = (3..=63).contains(&name.len())
        && valid_chars
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--");

    if valid {
        Ok(())
    } else {
        Err(StorageError::configuration(format!(
            "invalid container name '{name}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CONNECTION: &str =
        "AccountName=acct;AccountKey=YXBwbGVib3lzZW5keW91dGhlYmVzdHdpc2hlcw==";

    fn settings() -> StorageSettings {
        StorageSettings {
            backend: StorageBackend::Memory,
            container: "files".to_string(),
            connection_string: CONNECTION.to_string(),
            token_expiry_minutes: 15,
            signing: SigningMode::Auto,
            bearer_token: None,
        }
    }

    #[test]
    fn test_from_settings_defaults() {
        let config = StorageConfig::from_settings(&settings()).expect("valid settings");

        assert_eq!(config.container, "files");
        assert_eq!(config.token_ttl, Duration::minutes(15));
        assert_eq!(config.connection.account_name(), "acct");
        assert_eq!(config.provider_name(), "memory");
        assert!(config.serves_links_locally());
    }

    #[test]
    fn test_blank_bearer_token_is_dropped() {
        let mut raw = settings();
        raw.bearer_token = Some("   ".to_string());

        let config = StorageConfig::from_settings(&raw).expect("valid settings");
        assert!(config.bearer_token.is_none());
    }

    #[rstest]
    #[case(0)]
    #[case(-5)]
    #[case(StorageConfig::MAX_TOKEN_EXPIRY_MINUTES + 1)]
    #[case(i64::MAX)]
    #[case(i64::MIN)]
    fn test_rejects_out_of_range_ttl(#[case] minutes: i64) {
        let mut raw = settings();
        raw.token_expiry_minutes = minutes;

        let err = StorageConfig::from_settings(&raw).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[test]
    fn test_accepts_maximum_ttl() {
        let mut raw = settings();
        raw.token_expiry_minutes = StorageConfig::MAX_TOKEN_EXPIRY_MINUTES;

        let config = StorageConfig::from_settings(&raw).expect("seven days is allowed");
        assert_eq!(config.token_ttl, Duration::days(7));
    }

    #[test]
    fn test_validate_rejects_oversized_builder_ttl() {
        let config = StorageConfig::from_settings(&settings())
            .expect("valid settings")
            .with_token_ttl(Duration::days(365_000));

        assert!(matches!(config.validate(), Err(StorageError::Configuration(_))));
    }

    #[test]
    fn test_rejects_missing_connection_string() {
        let mut raw = settings();
        raw.connection_string = String::new();

        let err = StorageConfig::from_settings(&raw).unwrap_err();
        assert!(err.to_string().contains("connection string"));
    }

    #[rstest]
    #[case("")]
    #[case("ab")]
    #[case("Files")]
    #[case("-files")]
    #[case("files-")]
    #[case("my--files")]
    #[case("../etc")]
    fn test_rejects_invalid_container(#[case] container: &str) {
        let mut raw = settings();
        raw.container = container.to_string();

        let err = StorageConfig::from_settings(&raw).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)), "{container}");
    }

    #[test]
    fn test_debug_hides_bearer_token() {
        let config = StorageConfig::from_settings(&settings())
            .expect("valid settings")
            .with_bearer_token(Some("super-secret".to_string()));

        assert!(!format!("{config:?}").contains("super-secret"));
    }

    #[test]
    fn test_azure_backend_serves_links_remotely() {
        let config = StorageConfig::new(StorageBackend::AzureBlob, "files", CONNECTION)
            .expect("valid config");
        assert!(!config.serves_links_locally());
        assert_eq!(config.provider_name(), "azure_blob");
    }
}
