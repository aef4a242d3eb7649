//! Object storage facade over Apache OpenDAL.

use std::fmt;
use std::io;
use std::pin::pin;

use async_stream::try_stream;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use opendal::{ErrorKind, Operator, services};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use abacus_shared::StorageBackend;

use super::azure::AzureServiceClient;
use super::cancel::cancellable;
use super::config::StorageConfig;
use super::error::StorageError;
use super::sas::SasQuery;
use super::signer::{SignerChain, SigningRequest};

/// Directory under a `local_fs` root holding in-flight uploads. Its leading dot
/// keeps it clear of valid container names.
const STAGING_DIR: &str = ".staging";

/// Time-limited, read-only URL for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDownloadLink {
    /// Signed URL.
    pub url: Url,
    /// Start of validity.
    pub starts_on: DateTime<Utc>,
    /// End of validity (`starts_on + ttl`).
    pub expires_on: DateTime<Utc>,
}

/// Object content served through a verified signed link.
pub struct SignedObject {
    /// Object bytes, streamed from the backend.
    pub content: BoxStream<'static, io::Result<Bytes>>,
    /// Object size in bytes.
    pub content_length: u64,
    /// Stored content type, if the backend keeps one.
    pub content_type: Option<String>,
}

impl fmt::Debug for SignedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedObject")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Storage facade for one container.
///
/// Holds no mutable state; share it as `Arc<StorageService>`.
#[derive(Debug)]
pub struct StorageService {
    operator: Operator,
    config: StorageConfig,
    signers: SignerChain,
}

impl StorageService {
    /// Build the backend operator and make sure the container exists.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no signing strategy is usable or the
    /// backend cannot be initialized, and a backend error if the container
    /// cannot be created.
    pub async fn connect(
        config: StorageConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, StorageError> {
        config.validate()?;

        let azure = match config.backend {
            StorageBackend::AzureBlob => Some(AzureServiceClient::new(
                &config.connection,
                config.bearer_token.clone(),
            )?),
            _ => None,
        };
        let signers = SignerChain::build(config.signing, &config.connection, azure.as_ref())?;

        let created = match (&config.backend, &azure) {
            (StorageBackend::AzureBlob, Some(client)) => {
                cancellable(cancel, client.create_container_if_not_exists(&config.container))
                    .await?
            }
            (StorageBackend::LocalFs { root }, _) => {
                let dir = root.join(&config.container);
                cancellable(cancel, async {
                    let existed = tokio::fs::try_exists(&dir)
                        .await
                        .map_err(|e| container_dir_error(&dir, &e))?;
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(|e| container_dir_error(&dir, &e))?;
                    Ok(!existed)
                })
                .await?
            }
            _ => false,
        };
        let operator = Self::create_operator(&config)?;

        info!(
            provider = config.provider_name(),
            container = %config.container,
            created,
            signing = ?signers.strategies(),
            "Storage initialized"
        );

        Ok(Self {
            operator,
            config,
            signers,
        })
    }

    fn create_operator(config: &StorageConfig) -> Result<Operator, StorageError> {
        let operator = match &config.backend {
            StorageBackend::AzureBlob => {
                let connection = &config.connection;
                let mut builder = services::Azblob::default()
                    .container(&config.container)
                    .endpoint(connection.blob_endpoint().as_str().trim_end_matches('/'))
                    .account_name(connection.account_name());
                if let Some(key) = connection.account_key() {
                    builder = builder.account_key(key.as_base64());
                }
                if let Some(sas) = connection.shared_access_signature() {
                    builder = builder.sas_token(sas);
                }
                Operator::new(builder)?.finish()
            }
            StorageBackend::LocalFs { root } => {
                let dir = root.join(&config.container);
                let staging = root.join(STAGING_DIR).join(&config.container);
                let (Some(dir), Some(staging)) = (dir.to_str(), staging.to_str()) else {
                    return Err(StorageError::configuration("invalid path"));
                };
                // Uploads land in the staging dir and are renamed into place on close.
                let builder = services::Fs::default().root(dir).atomic_write_dir(staging);
                Operator::new(builder)?.finish()
            }
            StorageBackend::Memory => Operator::new(services::Memory::default())?.finish(),
        };
        Ok(operator)
    }

    /// Store `content` under `name`, refusing to overwrite.
    ///
    /// The stream is consumed once, chunk by chunk, into a single writer. The
    /// object only becomes visible once the writer closes: Azure commits the
    /// blob on close, and `local_fs` renames a staged file into place.
    ///
    /// # Errors
    ///
    /// - `FileExists` if `name` is already taken
    /// - `Content` if the stream yields an error
    /// - `Cancelled` if `cancel` fires; no partial object is left behind
    pub async fn upload<S>(
        &self,
        name: &str,
        content: S,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        validate_name(name)?;

        let conditional = self.supports_conditional_create();
        if !conditional {
            // Another writer can still slip in between this check and the write.
            debug!(blob = %name, "Backend lacks conditional create, checking existence first");
            if cancellable(cancel, self.exists(name)).await? {
                return Err(StorageError::file_exists(name));
            }
        }

        let mut request = self.operator.writer_with(name).if_not_exists(conditional);
        if let Some(content_type) = content_type.filter(|_| self.stores_content_type()) {
            request = request.content_type(content_type);
        }
        let mut writer = cancellable(cancel, async {
            request.await.map_err(|e| write_error(name, e))
        })
        .await?;

        let mut written: u64 = 0;
        let outcome = cancellable(cancel, async {
            let mut content = pin!(content);
            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(|e| StorageError::Content(e.to_string()))?;
                written += chunk.len() as u64;
                writer.write(chunk).await.map_err(|e| write_error(name, e))?;
            }
            writer.close().await.map_err(|e| write_error(name, e))?;
            Ok(())
        })
        .await;

        if let Err(err) = outcome {
            if let Err(abort_err) = writer.abort().await {
                debug!(blob = %name, error = %abort_err, "Writer abort failed");
            }
            return Err(err);
        }

        info!(
            container = %self.config.container,
            blob = %name,
            bytes = written,
            "Uploaded file"
        );
        Ok(())
    }

    /// Lazily enumerate object names, percent-encoded.
    ///
    /// The stream is one-shot and imposes no ordering.
    pub fn list<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<String, StorageError>> + Send + 'a {
        try_stream! {
            let lister = cancellable(cancel, async {
                self.operator
                    .lister_with("")
                    .recursive(true)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
            let mut lister = pin!(lister);

            loop {
                let next = cancellable(cancel, async {
                    lister.try_next().await.map_err(StorageError::from)
                })
                .await?;
                let Some(entry) = next else {
                    break;
                };
                if entry.metadata().is_dir() {
                    continue;
                }
                yield encode_name(entry.path());
            }

            debug!(container = %self.config.container, "Listed files");
        }
    }

    /// Issue a fresh signed download link for `name`.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if the object is absent, or the signer chain's error.
    pub async fn download(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<SignedDownloadLink, StorageError> {
        validate_name(name)?;
        if !cancellable(cancel, self.exists(name)).await? {
            return Err(StorageError::file_not_found(name));
        }

        let starts_on = Utc::now().trunc_subsecs(0);
        let expires_on = starts_on
            .checked_add_signed(self.config.token_ttl)
            .ok_or_else(|| StorageError::configuration("token expiry is out of range"))?;
        let object_url = self.object_url(name)?;

        let request = SigningRequest {
            account: self.config.connection.account_name(),
            container: &self.config.container,
            blob: name,
            url: &object_url,
            starts_on,
            expires_on,
        };
        let url = self.signers.sign(&request, cancel).await?;

        // A pre-signed connection SAS carries its own window.
        let signed = SasQuery::from_url(&url);
        let starts_on = signed.starts_on().unwrap_or(starts_on);
        let expires_on = signed.expires_on().unwrap_or(expires_on);

        debug!(blob = %name, expires_on = %expires_on, "Issued download link");
        Ok(SignedDownloadLink {
            url,
            starts_on,
            expires_on,
        })
    }

    /// Remove `name`. Returns `false` if it was already absent.
    ///
    /// Two concurrent deletes of the same object may both return `true`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be reached.
    pub async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<bool, StorageError> {
        validate_name(name)?;

        let deleted = cancellable(cancel, async {
            if !self.exists(name).await? {
                return Ok(false);
            }
            self.operator.delete(name).await?;
            Ok(true)
        })
        .await?;

        if deleted {
            info!(container = %self.config.container, blob = %name, "Deleted file");
        } else {
            debug!(container = %self.config.container, blob = %name, "Delete skipped, file absent");
        }
        Ok(deleted)
    }

    /// Serve an object through a signed link issued by this service.
    ///
    /// Only the local backends serve links themselves.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for an invalid, expired or foreign link and
    /// `FileNotFound` if the object is gone.
    pub async fn read_signed(
        &self,
        container: &str,
        name: &str,
        query: &SasQuery,
        cancel: &CancellationToken,
    ) -> Result<SignedObject, StorageError> {
        if !self.serves_links_locally() {
            return Err(StorageError::Forbidden(
                "signed links are served by the storage account".to_string(),
            ));
        }
        validate_name(name)?;
        self.verify_link(container, name, query, Utc::now())?;

        cancellable(cancel, async {
            let meta = match self.operator.stat(name).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::file_not_found(name));
                }
                Err(e) => return Err(e.into()),
            };
            let content = self
                .operator
                .reader(name)
                .await?
                .into_bytes_stream(..)
                .await?;
            Ok(SignedObject {
                content: content.boxed(),
                content_length: meta.content_length(),
                content_type: meta.content_type().map(str::to_string),
            })
        })
        .await
    }

    /// Check a shared-key link for `container/name` at time `now`.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` with the reason the link is refused.
    pub fn verify_link(
        &self,
        container: &str,
        name: &str,
        query: &SasQuery,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if container != self.config.container {
            return Err(StorageError::Forbidden(format!(
                "signed link does not cover container '{container}'"
            )));
        }
        let key = self.config.connection.account_key().ok_or_else(|| {
            StorageError::Forbidden("no account key available to verify signed links".to_string())
        })?;

        query
            .verify_shared_key(
                key,
                self.config.connection.account_name(),
                container,
                name,
                now,
            )
            .map_err(|e| {
                warn!(container = %container, blob = %name, reason = %e, "Signed link refused");
                StorageError::Forbidden(e.to_string())
            })
    }

    /// Container name.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.config.container
    }

    /// Whether the process itself must serve signed links (non-Azure backends).
    #[must_use]
    pub fn serves_links_locally(&self) -> bool {
        self.config.serves_links_locally()
    }

    /// Validated configuration.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn supports_conditional_create(&self) -> bool {
        self.operator.info().full_capability().write_with_if_not_exists
    }

    fn stores_content_type(&self) -> bool {
        self.operator.info().full_capability().write_with_content_type
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.operator.exists(name).await?)
    }

    fn object_url(&self, name: &str) -> Result<Url, StorageError> {
        let mut url = self.config.connection.blob_endpoint().clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::configuration("blob endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push(&self.config.container)
            .extend(name.split('/'));
        url.set_query(self.config.connection.shared_access_signature());
        Ok(url)
    }
}

fn container_dir_error(dir: &std::path::Path, err: &io::Error) -> StorageError {
    StorageError::configuration(format!(
        "cannot create container directory {}: {err}",
        dir.display()
    ))
}

fn write_error(name: &str, err: opendal::Error) -> StorageError {
    match err.kind() {
        ErrorKind::ConditionNotMatch | ErrorKind::AlreadyExists => StorageError::file_exists(name),
        _ => err.into(),
    }
}

/// Percent-encode a stored name, keeping only RFC 3986 unreserved characters.
#[must_use]
pub fn encode_name(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidName("name must not be empty".to_string()));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(StorageError::InvalidName(format!(
            "'{name}' must not start or end with '/'"
        )));
    }
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidName(format!(
            "'{name}' must not contain empty or relative path segments"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Encoded names contain only unreserved characters and escapes, and decode back.
        #[test]
        fn prop_encoded_names_are_url_safe(name in "[a-zA-Z0-9 ._~/%&?#+-]{1,40}") {
            let encoded = encode_name(&name);

            let safe = encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-._~%".contains(c));
            prop_assert!(safe, "unexpected character in {}", encoded);
            prop_assert_eq!(urlencoding::decode(&encoded).expect("utf-8"), name);
        }

        #[test]
        fn prop_plain_segment_names_are_valid(name in "[a-z0-9_-]{1,12}(/[a-z0-9_-]{1,12}){0,3}") {
            prop_assert!(validate_name(&name).is_ok());
        }
    }
}
