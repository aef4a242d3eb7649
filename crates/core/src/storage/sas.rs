//! Blob-scoped, read-only shared access signatures.
//!
//! Two flavors are produced, both for `sr=b` / `sp=r`:
//! - service SAS signed with the account key
//! - user delegation SAS signed with a key obtained from the storage service
//!
//! String-to-sign layouts follow the 2020-12-06+ service versions.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use url::Url;

use super::error::StorageError;

/// Signed service version written into every SAS.
pub const SAS_VERSION: &str = "2022-11-02";

const SAS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const READ_PERMISSION: &str = "r";
const BLOB_RESOURCE: &str = "b";

type HmacSha256 = Hmac<Sha256>;

/// Reasons a presented SAS is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SasError {
    /// Required query parameter absent.
    #[error("missing SAS parameter '{0}'")]
    Missing(&'static str),
    /// Query parameter present but unusable.
    #[error("malformed SAS parameter '{0}'")]
    Malformed(&'static str),
    /// Link used before its start time.
    #[error("signed link is not yet valid")]
    NotYetValid,
    /// Link used at or after its expiry time.
    #[error("signed link has expired")]
    Expired,
    /// Link does not grant read access to a blob.
    #[error("signed link does not grant read access")]
    PermissionDenied,
    /// Signature does not match the signed fields.
    #[error("signature mismatch")]
    BadSignature,
}

/// Decoded storage account key.
#[derive(Clone)]
pub struct AccountKey {
    encoded: String,
    bytes: Vec<u8>,
}

impl AccountKey {
    /// Decode a base64 account key.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the key is not valid base64.
    pub fn from_base64(encoded: &str) -> Result<Self, StorageError> {
        let bytes = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| StorageError::configuration("AccountKey is not valid base64"))?;
        Ok(Self {
            encoded: encoded.to_string(),
            bytes,
        })
    }

    /// The key as it appeared in the connection string.
    #[must_use]
    pub fn as_base64(&self) -> &str {
        &self.encoded
    }

    /// HMAC-SHA256 the input and return the base64 signature.
    #[must_use]
    pub fn sign(&self, string_to_sign: &str) -> String {
        hmac_base64(&self.bytes, string_to_sign)
    }

    /// Check a base64 signature in constant time.
    #[must_use]
    pub fn verify(&self, string_to_sign: &str, signature: &str) -> bool {
        let Ok(expected) = BASE64_STANDARD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.bytes) else {
            return false;
        };
        mac.update(string_to_sign.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountKey(<redacted>)")
    }
}

/// Short-lived signing key issued by the storage service.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UserDelegationKey {
    /// Object id of the principal the key was issued to.
    pub signed_oid: String,
    /// Tenant id of that principal.
    pub signed_tid: String,
    /// Key validity start.
    pub signed_start: String,
    /// Key validity end.
    pub signed_expiry: String,
    /// Service the key is valid for (`b`).
    pub signed_service: String,
    /// Service version that issued the key.
    pub signed_version: String,
    /// Base64 key material.
    pub value: String,
}

impl fmt::Debug for UserDelegationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDelegationKey")
            .field("signed_oid", &self.signed_oid)
            .field("signed_tid", &self.signed_tid)
            .field("signed_start", &self.signed_start)
            .field("signed_expiry", &self.signed_expiry)
            .field("signed_service", &self.signed_service)
            .field("signed_version", &self.signed_version)
            .finish_non_exhaustive()
    }
}

/// Builds a read-only SAS for one blob.
#[derive(Debug, Clone)]
pub struct BlobSasBuilder<'a> {
    account: &'a str,
    container: &'a str,
    blob: &'a str,
    starts_on: DateTime<Utc>,
    expires_on: DateTime<Utc>,
    https_only: bool,
}

impl<'a> BlobSasBuilder<'a> {
    /// Start a builder for `container/blob` valid in `[starts_on, expires_on)`.
    #[must_use]
    pub fn new(
        account: &'a str,
        container: &'a str,
        blob: &'a str,
        starts_on: DateTime<Utc>,
        expires_on: DateTime<Utc>,
    ) -> Self {
        Self {
            account,
            container,
            blob,
            starts_on,
            expires_on,
            https_only: false,
        }
    }

    /// Restrict the link to https (`spr=https`).
    #[must_use]
    pub fn https_only(mut self, https_only: bool) -> Self {
        self.https_only = https_only;
        self
    }

    fn protocol(&self) -> &'static str {
        if self.https_only { "https" } else { "" }
    }

    /// String-to-sign for a service SAS.
    #[must_use]
    pub fn shared_key_string_to_sign(&self) -> String {
        service_string_to_sign(&SignedFields {
            permissions: READ_PERMISSION,
            start: &format_sas_time(self.starts_on),
            expiry: &format_sas_time(self.expires_on),
            resource: &canonical_resource(self.account, self.container, self.blob),
            protocol: self.protocol(),
            version: SAS_VERSION,
        })
    }

    /// Sign with the account key.
    #[must_use]
    pub fn sign_with_account_key(&self, key: &AccountKey) -> SasQuery {
        let signature = key.sign(&self.shared_key_string_to_sign());
        let mut query = self.base_query();
        query.push("spr", self.protocol());
        query.push("sig", &signature);
        query
    }

    /// String-to-sign for a user delegation SAS.
    #[must_use]
    pub fn delegation_string_to_sign(&self, key: &UserDelegationKey) -> String {
        let start = format_sas_time(self.starts_on);
        let expiry = format_sas_time(self.expires_on);
        let resource = canonical_resource(self.account, self.container, self.blob);
        [
            READ_PERMISSION,
            start.as_str(),
            expiry.as_str(),
            resource.as_str(),
            key.signed_oid.as_str(),
            key.signed_tid.as_str(),
            key.signed_start.as_str(),
            key.signed_expiry.as_str(),
            key.signed_service.as_str(),
            key.signed_version.as_str(),
            "", // signedAuthorizedUserObjectId
            "", // signedUnauthorizedUserObjectId
            "", // signedCorrelationId
            "", // signedIP
            self.protocol(),
            SAS_VERSION,
            BLOB_RESOURCE,
            "", // signedSnapshotTime
            "", // signedEncryptionScope
            "", // rscc
            "", // rscd
            "", // rsce
            "", // rscl
            "", // rsct
        ]
        .join("\n")
    }

    /// Sign with a user delegation key.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the key material is not valid base64.
    pub fn sign_with_delegation_key(
        &self,
        key: &UserDelegationKey,
    ) -> Result<SasQuery, StorageError> {
        let bytes = BASE64_STANDARD
            .decode(&key.value)
            .map_err(|_| StorageError::backend("user delegation key is not valid base64"))?;
        let signature = hmac_base64(&bytes, &self.delegation_string_to_sign(key));

        let mut query = self.base_query();
        query.push("skoid", &key.signed_oid);
        query.push("sktid", &key.signed_tid);
        query.push("skt", &key.signed_start);
        query.push("ske", &key.signed_expiry);
        query.push("sks", &key.signed_service);
        query.push("skv", &key.signed_version);
        query.push("spr", self.protocol());
        query.push("sig", &signature);
        Ok(query)
    }

    fn base_query(&self) -> SasQuery {
        let mut query = SasQuery::default();
        query.push("sv", SAS_VERSION);
        query.push("st", &format_sas_time(self.starts_on));
        query.push("se", &format_sas_time(self.expires_on));
        query.push("sr", BLOB_RESOURCE);
        query.push("sp", READ_PERMISSION);
        query
    }
}

/// SAS query parameters, in issue order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SasQuery {
    params: Vec<(String, String)>,
}

impl SasQuery {
    /// Collect the query parameters of a URL.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())))
    }

    /// Collect already-decoded key/value pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            params: pairs.into_iter().collect(),
        }
    }

    fn push(&mut self, key: &str, value: &str) {
        // Empty optional fields are signed as empty lines but not sent.
        if !value.is_empty() {
            self.params.push((key.to_string(), value.to_string()));
        }
    }

    /// First value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a signature is present.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.get("sig").is_some_and(|s| !s.is_empty())
    }

    /// Decoded `st`.
    #[must_use]
    pub fn starts_on(&self) -> Option<DateTime<Utc>> {
        self.get("st").and_then(parse_sas_time)
    }

    /// Decoded `se`.
    #[must_use]
    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.get("se").and_then(parse_sas_time)
    }

    /// Append the parameters to `url`, keeping any query it already has.
    pub fn apply_to(&self, url: &mut Url) {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &self.params {
            pairs.append_pair(k, v);
        }
    }

    /// Check a service SAS issued with `key` for `container/blob` at time `now`.
    ///
    /// # Errors
    ///
    /// Returns the first reason the link is refused.
    pub fn verify_shared_key(
        &self,
        key: &AccountKey,
        account: &str,
        container: &str,
        blob: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SasError> {
        let signature = self.get("sig").ok_or(SasError::Missing("sig"))?;
        let version = self.get("sv").ok_or(SasError::Missing("sv"))?;
        let permissions = self.get("sp").ok_or(SasError::Missing("sp"))?;
        let resource = self.get("sr").ok_or(SasError::Missing("sr"))?;
        let expiry_raw = self.get("se").ok_or(SasError::Missing("se"))?;
        let expiry = parse_sas_time(expiry_raw).ok_or(SasError::Malformed("se"))?;
        let start_raw = self.get("st").unwrap_or_default();
        let protocol = self.get("spr").unwrap_or_default();

        let string_to_sign = service_string_to_sign(&SignedFields {
            permissions,
            start: start_raw,
            expiry: expiry_raw,
            resource: &canonical_resource(account, container, blob),
            protocol,
            version,
        });
        if !key.verify(&string_to_sign, signature) {
            return Err(SasError::BadSignature);
        }

        if resource != BLOB_RESOURCE || !permissions.contains(READ_PERMISSION) {
            return Err(SasError::PermissionDenied);
        }
        if !start_raw.is_empty() {
            let start = parse_sas_time(start_raw).ok_or(SasError::Malformed("st"))?;
            if now < start {
                return Err(SasError::NotYetValid);
            }
        }
        if now >= expiry {
            return Err(SasError::Expired);
        }
        Ok(())
    }
}

impl fmt::Display for SasQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.params)
            .finish();
        f.write_str(&encoded)
    }
}

struct SignedFields<'a> {
    permissions: &'a str,
    start: &'a str,
    expiry: &'a str,
    resource: &'a str,
    protocol: &'a str,
    version: &'a str,
}

fn service_string_to_sign(fields: &SignedFields<'_>) -> String {
    [
        fields.permissions,
        fields.start,
        fields.expiry,
        fields.resource,
        "", // signedIdentifier
        "", // signedIP
        fields.protocol,
        fields.version,
        BLOB_RESOURCE,
        "", // signedSnapshotTime
        "", // signedEncryptionScope
        "", // rscc
        "", // rscd
        "", // rsce
        "", // rscl
        "", // rsct
    ]
    .join("\n")
}

fn canonical_resource(account: &str, container: &str, blob: &str) -> String {
    format!("/blob/{account}/{container}/{blob}")
}

fn hmac_base64(key: &[u8], string_to_sign: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

/// Format a timestamp the way SAS fields expect it.
#[must_use]
pub fn format_sas_time(time: DateTime<Utc>) -> String {
    time.format(SAS_TIME_FORMAT).to_string()
}

/// Parse a SAS timestamp (`YYYY-MM-DDTHH:MM:SSZ`).
#[must_use]
pub fn parse_sas_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, SAS_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const KEY: &str = "YXBwbGVib3lzZW5keW91dGhlYmVzdHdpc2hlc2Zvcm1lcnJ5Y2hyaXN0bWFz";

    fn key() -> AccountKey {
        AccountKey::from_base64(KEY).expect("valid key")
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid time");
        (start, start + Duration::minutes(15))
    }

    fn delegation_key() -> UserDelegationKey {
        UserDelegationKey {
            signed_oid: "oid".to_string(),
            signed_tid: "tid".to_string(),
            signed_start: "2026-03-01T12:00:00Z".to_string(),
            signed_expiry: "2026-03-01T12:15:00Z".to_string(),
            signed_service: "b".to_string(),
            signed_version: "2022-11-02".to_string(),
            value: BASE64_STANDARD.encode([7u8; 32]),
        }
    }

    #[test]
    fn test_service_string_to_sign_layout() {
        let (start, expiry) = window();
        let builder = BlobSasBuilder::new("acct", "files", "dir/a b.txt", start, expiry);

        let sts = builder.shared_key_string_to_sign();
        let lines: Vec<&str> = sts.split('\n').collect();

        assert_eq!(lines.len(), 16);
        assert_eq!(lines[0], "r");
        assert_eq!(lines[1], "2026-03-01T12:00:00Z");
        assert_eq!(lines[2], "2026-03-01T12:15:00Z");
        assert_eq!(lines[3], "/blob/acct/files/dir/a b.txt");
        assert_eq!(lines[6], "");
        assert_eq!(lines[7], SAS_VERSION);
        assert_eq!(lines[8], "b");
    }

    #[test]
    fn test_delegation_string_to_sign_layout() {
        let (start, expiry) = window();
        let builder =
            BlobSasBuilder::new("acct", "files", "a.txt", start, expiry).https_only(true);

        let sts = builder.delegation_string_to_sign(&delegation_key());
        let lines: Vec<&str> = sts.split('\n').collect();

        assert_eq!(lines.len(), 24);
        assert_eq!(lines[4], "oid");
        assert_eq!(lines[5], "tid");
        assert_eq!(lines[8], "b");
        assert_eq!(lines[14], "https");
        assert_eq!(lines[15], SAS_VERSION);
        assert_eq!(lines[16], "b");
    }

    #[test]
    fn test_shared_key_query_round_trips_through_url() {
        let (start, expiry) = window();
        let query = BlobSasBuilder::new("acct", "files", "a.txt", start, expiry)
            .https_only(true)
            .sign_with_account_key(&key());

        let mut url = Url::parse("https://acct.blob.core.windows.net/files/a.txt").expect("url");
        query.apply_to(&mut url);
        let parsed = SasQuery::from_url(&url);

        assert_eq!(parsed, query);
        assert_eq!(parsed.get("sp"), Some("r"));
        assert_eq!(parsed.get("sr"), Some("b"));
        assert_eq!(parsed.get("spr"), Some("https"));
        assert_eq!(parsed.starts_on(), Some(start));
        assert_eq!(parsed.expires_on(), Some(expiry));
        assert!(parsed.is_signed());
    }

    #[test]
    fn test_delegation_query_carries_key_fields() {
        let (start, expiry) = window();
        let query = BlobSasBuilder::new("acct", "files", "a.txt", start, expiry)
            .sign_with_delegation_key(&delegation_key())
            .expect("signs");

        assert_eq!(query.get("skoid"), Some("oid"));
        assert_eq!(query.get("sktid"), Some("tid"));
        assert_eq!(query.get("sks"), Some("b"));
        assert_eq!(query.get("spr"), None);
        assert!(query.is_signed());
    }

    #[test]
    fn test_delegation_key_with_bad_material_is_rejected() {
        let (start, expiry) = window();
        let mut bad = delegation_key();
        bad.value = "%%%".to_string();

        let err = BlobSasBuilder::new("acct", "files", "a.txt", start, expiry)
            .sign_with_delegation_key(&bad)
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[test]
    fn test_verify_accepts_inside_window() {
        let (start, expiry) = window();
        let query = BlobSasBuilder::new("acct", "files", "a.txt", start, expiry)
            .sign_with_account_key(&key());

        let now = start + Duration::minutes(5);
        assert_eq!(
            query.verify_shared_key(&key(), "acct", "files", "a.txt", now),
            Ok(())
        );
    }

    #[test]
    fn test_verify_rejects_outside_window() {
        let (start, expiry) = window();
        let query = BlobSasBuilder::new("acct", "files", "a.txt", start, expiry)
            .sign_with_account_key(&key());

        assert_eq!(
            query.verify_shared_key(&key(), "acct", "files", "a.txt", expiry),
            Err(SasError::Expired)
        );
        assert_eq!(
            query.verify_shared_key(
                &key(),
                "acct",
                "files",
                "a.txt",
                start - Duration::seconds(1)
            ),
            Err(SasError::NotYetValid)
        );
    }

    #[test]
    fn test_verify_rejects_other_blob_and_tampering() {
        let (start, expiry) = window();
        let query = BlobSasBuilder::new("acct", "files", "a.txt", start, expiry)
            .sign_with_account_key(&key());
        let now = start + Duration::minutes(1);

        assert_eq!(
            query.verify_shared_key(&key(), "acct", "files", "b.txt", now),
            Err(SasError::BadSignature)
        );

        let extended = SasQuery::from_pairs(query.params.iter().map(|(k, v)| {
            if k == "se" {
                (k.clone(), "2030-01-01T00:00:00Z".to_string())
            } else {
                (k.clone(), v.clone())
            }
        }));
        assert_eq!(
            extended.verify_shared_key(&key(), "acct", "files", "a.txt", now),
            Err(SasError::BadSignature)
        );

        let other_key = AccountKey::from_base64("b3RoZXJrZXk=").expect("valid key");
        assert_eq!(
            query.verify_shared_key(&other_key, "acct", "files", "a.txt", now),
            Err(SasError::BadSignature)
        );
    }

    #[test]
    fn test_verify_requires_signature() {
        let query = SasQuery::from_pairs([("sv".to_string(), SAS_VERSION.to_string())]);
        assert_eq!(
            query.verify_shared_key(&key(), "acct", "files", "a.txt", Utc::now()),
            Err(SasError::Missing("sig"))
        );
    }

    #[test]
    fn test_account_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", key()), "AccountKey(<redacted>)");
    }

    #[test]
    fn test_sas_time_format() {
        let (start, _) = window();
        assert_eq!(format_sas_time(start), "2026-03-01T12:00:00Z");
        assert_eq!(parse_sas_time("2026-03-01T12:00:00Z"), Some(start));
        assert_eq!(parse_sas_time("yesterday"), None);
    }
}
