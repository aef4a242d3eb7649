//! Azure storage connection string parsing.

use std::fmt;
use std::str::FromStr;

use url::Url;

use super::error::StorageError;
use super::sas::AccountKey;

/// Account name of the local storage emulator.
pub const DEVELOPMENT_ACCOUNT_NAME: &str = "devstoreaccount1";
/// Well-known, public account key of the local storage emulator.
pub const DEVELOPMENT_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEVELOPMENT_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

const DEFAULT_PROTOCOL: &str = "https";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Parsed storage connection string.
///
/// Only the blob-related keys are kept; queue, table and file endpoints are ignored.
#[derive(Clone)]
pub struct ConnectionString {
    account_name: String,
    account_key: Option<AccountKey>,
    blob_endpoint: Url,
    shared_access_signature: Option<String>,
}

impl ConnectionString {
    /// Storage account name.
    #[must_use]
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Shared account key, when the connection string carries one.
    #[must_use]
    pub fn account_key(&self) -> Option<&AccountKey> {
        self.account_key.as_ref()
    }

    /// Blob service endpoint.
    #[must_use]
    pub fn blob_endpoint(&self) -> &Url {
        &self.blob_endpoint
    }

    /// Account SAS query (without the leading `?`), when present.
    #[must_use]
    pub fn shared_access_signature(&self) -> Option<&str> {
        self.shared_access_signature.as_deref()
    }

    fn development() -> Result<Self, StorageError> {
        Ok(Self {
            account_name: DEVELOPMENT_ACCOUNT_NAME.to_string(),
            account_key: Some(AccountKey::from_base64(DEVELOPMENT_ACCOUNT_KEY)?),
            blob_endpoint: parse_endpoint(DEVELOPMENT_BLOB_ENDPOINT)?,
            shared_access_signature: None,
        })
    }
}

impl FromStr for ConnectionString {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StorageError::configuration(
                "storage connection string is not configured",
            ));
        }

        let mut protocol = None;
        let mut account_name = None;
        let mut account_key = None;
        let mut endpoint_suffix = None;
        let mut blob_endpoint = None;
        let mut sas = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Values (keys, signatures) may contain '='; split on the first one only.
            let Some((key, value)) = part.split_once('=') else {
                return Err(StorageError::configuration(
                    "malformed connection string segment, expected Key=Value",
                ));
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "usedevelopmentstorage" if value.eq_ignore_ascii_case("true") => {
                    return Self::development();
                }
                "defaultendpointsprotocol" => protocol = Some(value.to_ascii_lowercase()),
                "accountname" => account_name = Some(value.to_string()),
                "accountkey" => account_key = Some(AccountKey::from_base64(value)?),
                "endpointsuffix" => endpoint_suffix = Some(value.to_string()),
                "blobendpoint" => blob_endpoint = Some(parse_endpoint(value)?),
                "sharedaccesssignature" => {
                    sas = Some(value.trim_start_matches('?').to_string());
                }
                _ => {}
            }
        }

        let blob_endpoint = match (blob_endpoint, &account_name) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => parse_endpoint(&format!(
                "{}://{}.blob.{}",
                protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL),
                account,
                endpoint_suffix.as_deref().unwrap_or(DEFAULT_ENDPOINT_SUFFIX)
            ))?,
            (None, None) => {
                return Err(StorageError::configuration(
                    "connection string needs AccountName or BlobEndpoint",
                ));
            }
        };

        let account_name = match account_name {
            Some(name) => name,
            None => account_from_host(&blob_endpoint).ok_or_else(|| {
                StorageError::configuration("cannot derive account name from BlobEndpoint")
            })?,
        };

        Ok(Self {
            account_name,
            account_key,
            blob_endpoint,
            shared_access_signature: sas.filter(|s| !s.is_empty()),
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("account_name", &self.account_name)
            .field("account_key", &self.account_key)
            .field("blob_endpoint", &self.blob_endpoint.as_str())
            .field(
                "shared_access_signature",
                &self.shared_access_signature.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn parse_endpoint(value: &str) -> Result<Url, StorageError> {
    let mut url = Url::parse(value.trim_end_matches('/'))
        .map_err(|e| StorageError::configuration(format!("invalid blob endpoint: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(StorageError::configuration(format!(
            "invalid blob endpoint: {value}"
        )));
    }
    url.set_query(None);
    Ok(url)
}

fn account_from_host(endpoint: &Url) -> Option<String> {
    endpoint
        .host_str()
        .and_then(|host| host.split('.').next())
        .filter(|label| !label.is_empty() && label.parse::<u8>().is_err())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KEY: &str = "YXBwbGVib3lzZW5keW91dGhlYmVzdHdpc2hlcw==";

    #[test]
    fn test_parses_account_key_connection_string() {
        let cs: ConnectionString = format!(
            "DefaultEndpointsProtocol=https;AccountName=testaccount;AccountKey={KEY};EndpointSuffix=core.windows.net"
        )
        .parse()
        .expect("valid connection string");

        assert_eq!(cs.account_name(), "testaccount");
        assert_eq!(
            cs.blob_endpoint().as_str(),
            "https://testaccount.blob.core.windows.net/"
        );
        assert_eq!(cs.account_key().map(AccountKey::as_base64), Some(KEY));
        assert!(cs.shared_access_signature().is_none());
    }

    #[test]
    fn test_development_storage_shortcut() {
        let cs: ConnectionString = "UseDevelopmentStorage=true".parse().expect("valid");

        assert_eq!(cs.account_name(), DEVELOPMENT_ACCOUNT_NAME);
        assert_eq!(
            cs.blob_endpoint().as_str(),
            "http://127.0.0.1:10000/devstoreaccount1"
        );
        assert!(cs.account_key().is_some());
    }

    #[test]
    fn test_sas_connection_string_derives_account_from_host() {
        let cs: ConnectionString =
            "BlobEndpoint=https://acme.blob.core.windows.net/;SharedAccessSignature=?sv=2022-11-02&sig=abc%3D"
                .parse()
                .expect("valid");

        assert_eq!(cs.account_name(), "acme");
        assert_eq!(cs.shared_access_signature(), Some("sv=2022-11-02&sig=abc%3D"));
        assert!(cs.account_key().is_none());
    }

    #[test]
    fn test_explicit_endpoint_wins_over_suffix() {
        let cs: ConnectionString = format!(
            "AccountName=local;AccountKey={KEY};BlobEndpoint=http://localhost:8080/blob/;EndpointSuffix=ignored"
        )
        .parse()
        .expect("valid");

        assert_eq!(cs.blob_endpoint().as_str(), "http://localhost:8080/blob");
        assert_eq!(cs.account_name(), "local");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cs: ConnectionString = format!(
            "AccountName=acme;AccountKey={KEY};SharedAccessSignature=sv=1&sig=secret"
        )
        .parse()
        .expect("valid");

        let debug = format!("{cs:?}");
        assert!(!debug.contains(KEY));
        assert!(!debug.contains("secret"));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("DefaultEndpointsProtocol=https")]
    #[case("AccountName=acme;AccountKey=not base64!")]
    #[case("AccountName=acme;garbage")]
    #[case("BlobEndpoint=not a url")]
    #[case("BlobEndpoint=http://127.0.0.1:10000")]
    fn test_rejects_invalid(#[case] raw: &str) {
        let err = raw.parse::<ConnectionString>().unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)), "{raw}: {err}");
    }
}
