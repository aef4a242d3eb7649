//! Download link signing strategies.
//!
//! Strategies are tried in order and the first one that produces a URL wins:
//!
//! ```text
//! AlreadySigned ──► DelegationKey ──► SharedKey ──► Configuration error
//! (endpoint SAS)    (bearer token)    (AccountKey)
//! ```

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use abacus_shared::SigningMode;

use super::azure::AzureServiceClient;
use super::cancel::cancellable;
use super::connection_string::ConnectionString;
use super::error::StorageError;
use super::sas::{AccountKey, BlobSasBuilder, SasQuery};

/// Everything a strategy needs to sign one object.
#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    /// Storage account name.
    pub account: &'a str,
    /// Container name.
    pub container: &'a str,
    /// Unencoded object name.
    pub blob: &'a str,
    /// Object URL, carrying the endpoint SAS if the connection string has one.
    pub url: &'a Url,
    /// Start of the validity window.
    pub starts_on: DateTime<Utc>,
    /// End of the validity window.
    pub expires_on: DateTime<Utc>,
}

impl SigningRequest<'_> {
    fn builder(&self) -> BlobSasBuilder<'_> {
        BlobSasBuilder::new(
            self.account,
            self.container,
            self.blob,
            self.starts_on,
            self.expires_on,
        )
        .https_only(self.url.scheme() == "https")
    }

    fn bare_url(&self) -> Url {
        let mut url = self.url.clone();
        url.set_query(None);
        url
    }
}

/// One way of producing a signed URL.
#[derive(Debug, Clone)]
pub enum Signer {
    /// The object URL already carries an unexpired SAS.
    AlreadySigned,
    /// User delegation key from the storage service.
    DelegationKey(AzureServiceClient),
    /// Account key from the connection string.
    SharedKey(AccountKey),
}

impl Signer {
    /// Strategy name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AlreadySigned => "already_signed",
            Self::DelegationKey(_) => "delegation_key",
            Self::SharedKey(_) => "shared_key",
        }
    }

    /// Returns `Ok(None)` when this strategy does not apply to the request.
    async fn sign(
        &self,
        request: &SigningRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<Url>, StorageError> {
        match self {
            Self::AlreadySigned => {
                let query = SasQuery::from_url(request.url);
                let unexpired = query
                    .expires_on()
                    .is_none_or(|expiry| expiry > request.starts_on);
                Ok((query.is_signed() && unexpired).then(|| request.url.clone()))
            }
            Self::DelegationKey(client) => {
                let key = cancellable(
                    cancel,
                    client.get_user_delegation_key(request.starts_on, request.expires_on),
                )
                .await?;
                let Some(key) = key else {
                    return Ok(None);
                };
                let query = request.builder().sign_with_delegation_key(&key)?;
                let mut url = request.bare_url();
                query.apply_to(&mut url);
                Ok(Some(url))
            }
            Self::SharedKey(key) => {
                let query = request.builder().sign_with_account_key(key);
                let mut url = request.bare_url();
                query.apply_to(&mut url);
                Ok(Some(url))
            }
        }
    }
}

/// Ordered signing strategies for one deployment.
#[derive(Debug, Clone)]
pub struct SignerChain {
    signers: Vec<Signer>,
    mode: SigningMode,
}

impl SignerChain {
    /// Build the chain allowed by `mode` from the available credentials.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no strategy could ever sign a link.
    pub fn build(
        mode: SigningMode,
        connection: &ConnectionString,
        azure: Option<&AzureServiceClient>,
    ) -> Result<Self, StorageError> {
        let mut signers = Vec::new();

        if connection.shared_access_signature().is_some() {
            signers.push(Signer::AlreadySigned);
        }
        if matches!(mode, SigningMode::Auto | SigningMode::DelegationKey) {
            if let Some(client) = azure.filter(|c| c.can_request_delegation_key()) {
                signers.push(Signer::DelegationKey(client.clone()));
            }
        }
        if matches!(mode, SigningMode::Auto | SigningMode::SharedKey) {
            if let Some(key) = connection.account_key() {
                signers.push(Signer::SharedKey(key.clone()));
            }
        }

        if signers.is_empty() {
            let needed = match mode {
                SigningMode::Auto => "a SharedAccessSignature, a bearer token or an AccountKey",
                SigningMode::DelegationKey => "a bearer token (azure_blob backend)",
                SigningMode::SharedKey => "an AccountKey in the connection string",
            };
            return Err(StorageError::configuration(format!(
                "cannot sign download links: signing mode {mode:?} needs {needed}"
            )));
        }

        Ok(Self { signers, mode })
    }

    /// Strategy names in the order they are tried.
    #[must_use]
    pub fn strategies(&self) -> Vec<&'static str> {
        self.signers.iter().map(Signer::name).collect()
    }

    /// Sign `request` with the first applicable strategy.
    ///
    /// In `auto` mode a failing strategy falls through to the next one;
    /// cancellation never falls through.
    ///
    /// # Errors
    ///
    /// Returns the last strategy error, or a configuration error if no strategy applied.
    pub async fn sign(
        &self,
        request: &SigningRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Url, StorageError> {
        let mut last_error = None;

        for signer in &self.signers {
            match signer.sign(request, cancel).await {
                Ok(Some(url)) => {
                    debug!(
                        strategy = signer.name(),
                        blob = %request.blob,
                        "Signed download link"
                    );
                    return Ok(url);
                }
                Ok(None) => {}
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
                Err(err) if self.mode == SigningMode::Auto => {
                    warn!(
                        strategy = signer.name(),
                        error = %err,
                        "Signing strategy failed, trying the next one"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StorageError::configuration("no signing strategy could sign the download link")
        }))
    }
}
