//! Application configuration management.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable holding the storage account connection string.
pub const CONNECTION_STRING_ENV: &str = "AZURE_STORAGE_CONNECTION_STRING";
/// Environment variable holding the blob container name.
pub const CONTAINER_NAME_ENV: &str = "AZURE_STORAGE_CONTAINER_NAME";
/// Environment variable holding a pre-acquired Azure AD bearer token.
pub const BEARER_TOKEN_ENV: &str = "AZURE_STORAGE_BEARER_TOKEN";

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Object storage configuration.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body accepted by the upload endpoint.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

/// Which object store backs the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Azure Blob Storage (or Azurite).
    #[default]
    AzureBlob,
    /// Local filesystem, one directory per container (development only).
    LocalFs {
        /// Root directory holding container directories.
        root: PathBuf,
    },
    /// In-process memory store (tests only).
    Memory,
}

/// How download links are signed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// Already-signed, then delegation key, then shared key.
    #[default]
    Auto,
    /// Only user delegation keys (after an already-signed endpoint).
    DelegationKey,
    /// Only the account key from the connection string (after an already-signed endpoint).
    SharedKey,
}

/// Raw object storage settings, validated by the storage layer at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Backend kind.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Blob container name.
    #[serde(default)]
    pub container: String,
    /// Azure storage connection string.
    #[serde(default)]
    pub connection_string: String,
    /// Signed download link lifetime in minutes.
    #[serde(default = "default_token_expiry_minutes")]
    pub token_expiry_minutes: i64,
    /// Signing strategy for download links.
    #[serde(default)]
    pub signing: SigningMode,
    /// Bearer token used to request user delegation keys.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            container: String::new(),
            connection_string: String::new(),
            token_expiry_minutes: default_token_expiry_minutes(),
            signing: SigningMode::default(),
            bearer_token: None,
        }
    }
}

fn default_token_expiry_minutes() -> i64 {
    15
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_filter() -> String {
    "abacus=debug,tower_http=debug".to_string()
}

impl AppConfig {
    /// Loads configuration from the `config/` directory and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(Path::new("config"))
    }

    /// Loads configuration from files in `dir` and the environment.
    ///
    /// Later sources win: `default`, then `{RUN_MODE}`, then `ABACUS__*`
    /// variables, then the well-known `AZURE_STORAGE_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load_from(dir: &Path) -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(
                config::File::with_name(&dir.join("default").to_string_lossy()).required(false),
            )
            .add_source(
                config::File::with_name(&dir.join(&run_mode).to_string_lossy()).required(false),
            )
            .add_source(
                config::Environment::with_prefix("ABACUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("storage.connection_string", non_blank_env(CONNECTION_STRING_ENV))?
            .set_override_option("storage.container", non_blank_env(CONTAINER_NAME_ENV))?
            .set_override_option("storage.bearer_token", non_blank_env(BEARER_TOKEN_ENV))?
            .build()?;

        config.try_deserialize()
    }
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
