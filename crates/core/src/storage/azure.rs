//! Azure Blob REST calls that OpenDAL does not expose.
//!
//! Only two account-level operations live here:
//! - `Create Container` (create-if-absent, private)
//! - `Get User Delegation Key`
//!
//! Container creation is authorized with Shared Key when the connection string
//! carries an account key, otherwise with the bearer token, otherwise with the
//! connection string's SAS.

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use super::connection_string::ConnectionString;
use super::error::StorageError;
use super::sas::{AccountKey, UserDelegationKey, format_sas_time};

/// REST API version sent with every request.
pub const AZURE_API_VERSION: &str = "2022-11-02";

/// Client for account-level Azure Blob operations.
#[derive(Clone)]
pub struct AzureServiceClient {
    http: reqwest::Client,
    account: String,
    endpoint: Url,
    account_key: Option<AccountKey>,
    sas: Option<String>,
    bearer_token: Option<String>,
}

impl fmt::Debug for AzureServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceClient")
            .field("account", &self.account)
            .field("endpoint", &self.endpoint.as_str())
            .field("shared_key", &self.account_key.is_some())
            .field("sas", &self.sas.is_some())
            .field("bearer_token", &self.bearer_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename = "KeyInfo", rename_all = "PascalCase")]
struct KeyInfo {
    start: String,
    expiry: String,
}

impl AzureServiceClient {
    /// Create a client for the account described by `connection`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(
        connection: &ConnectionString,
        bearer_token: Option<String>,
    ) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("abacus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StorageError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            account: connection.account_name().to_string(),
            endpoint: connection.blob_endpoint().clone(),
            account_key: connection.account_key().cloned(),
            sas: connection.shared_access_signature().map(str::to_string),
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Whether a bearer token is available for delegation key requests.
    #[must_use]
    pub fn can_request_delegation_key(&self) -> bool {
        self.bearer_token.is_some()
    }

    /// Create `container` with no public access if it does not exist.
    ///
    /// Returns `true` when the container was created by this call.
    ///
    /// # Errors
    ///
    /// Returns a backend error on any status other than 201 or 409.
    pub async fn create_container_if_not_exists(
        &self,
        container: &str,
    ) -> Result<bool, StorageError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::configuration("blob endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push(container);
        url.query_pairs_mut().append_pair("restype", "container");

        let date = rfc1123_now();
        let mut request = self
            .http
            .put(url.clone())
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .body("");

        if let Some(key) = &self.account_key {
            let string_to_sign = self.container_string_to_sign(&url, &date);
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("SharedKey {}:{}", self.account, key.sign(&string_to_sign)),
            );
        } else if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        } else if let Some(sas) = &self.sas {
            let pairs: Vec<(String, String)> = url::form_urlencoded::parse(sas.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            request = request.query(&pairs);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::CREATED => {
                info!(container = %container, "Created blob container");
                Ok(true)
            }
            StatusCode::CONFLICT => {
                debug!(container = %container, "Blob container already exists");
                Ok(false)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(map_azure_error("create container", status, &body))
            }
        }
    }

    /// Request a user delegation key valid for `[starts_on, expires_on]`.
    ///
    /// Returns `None` when no bearer token is configured.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the service refuses the request or answers
    /// with an unreadable body.
    pub async fn get_user_delegation_key(
        &self,
        starts_on: DateTime<Utc>,
        expires_on: DateTime<Utc>,
    ) -> Result<Option<UserDelegationKey>, StorageError> {
        let Some(token) = &self.bearer_token else {
            return Ok(None);
        };

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::configuration("blob endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push("");
        url.query_pairs_mut()
            .append_pair("restype", "service")
            .append_pair("comp", "userdelegationkey");

        let body = quick_xml::se::to_string(&KeyInfo {
            start: format_sas_time(starts_on),
            expiry: format_sas_time(expires_on),
        })
        .map_err(|e| StorageError::backend(format!("failed to encode KeyInfo: {e}")))?;

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("x-ms-date", rfc1123_now())
            .header("x-ms-version", AZURE_API_VERSION)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(format!(r#"<?xml version="1.0" encoding="utf-8"?>{body}"#))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(map_azure_error("get user delegation key", status, &text));
        }

        let key: UserDelegationKey = quick_xml::de::from_str(&text).map_err(|e| {
            StorageError::backend(format!("unreadable user delegation key response: {e}"))
        })?;
        debug!(signed_expiry = %key.signed_expiry, "Obtained user delegation key");
        Ok(Some(key))
    }

    /// Shared Key string-to-sign for a body-less container PUT.
    fn container_string_to_sign(&self, url: &Url, date: &str) -> String {
        let canonicalized_headers =
            format!("x-ms-date:{date}\nx-ms-version:{AZURE_API_VERSION}");

        let mut canonicalized_resource = format!("/{}{}", self.account, url.path());
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_lowercase(), v.into_owned()))
            .collect();
        params.sort();
        for (k, v) in params {
            canonicalized_resource.push_str(&format!("\n{k}:{v}"));
        }

        // VERB, 11 standard headers (all empty for this request), then x-ms-* and resource.
        format!("PUT\n\n\n\n\n\n\n\n\n\n\n\n{canonicalized_headers}\n{canonicalized_resource}")
    }
}

fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn map_azure_error(context: &str, status: StatusCode, body: &str) -> StorageError {
    let code = extract_error_code(body).unwrap_or("unknown");
    StorageError::backend(format!("Azure {context}: HTTP {status} ({code})"))
}

/// Pulls `<Code>` out of an Azure XML error body.
fn extract_error_code(body: &str) -> Option<&str> {
    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    Some(&body[start..end])
}
