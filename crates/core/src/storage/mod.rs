//! Object storage facade for a single container, using Apache OpenDAL.
//!
//! Supported backends:
//! - Azure Blob Storage (and Azurite via `UseDevelopmentStorage=true`)
//! - Local filesystem (development only)
//! - In-memory (tests)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        StorageService                            │
//! │      upload · list · download (signed link) · delete             │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │        Apache OpenDAL          │        SignerChain               │
//! │ writer_with(..).if_not_exists  │ AlreadySigned → DelegationKey    │
//! │ lister_with(..).recursive      │              → SharedKey         │
//! │ exists · delete · read         │                                  │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │ AzureServiceClient: create container, get user delegation key    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation takes a `CancellationToken`; a fired token aborts the
//! in-flight backend call and surfaces as [`StorageError::Cancelled`].

mod azure;
mod cancel;
mod config;
mod connection_string;
mod error;
mod sas;
mod service;
mod signer;

pub use azure::{AZURE_API_VERSION, AzureServiceClient};
pub use config::StorageConfig;
pub use connection_string::ConnectionString;
pub use error::StorageError;
pub use sas::{
    AccountKey, BlobSasBuilder, SAS_VERSION, SasError, SasQuery, UserDelegationKey,
    format_sas_time, parse_sas_time,
};
pub use service::{SignedDownloadLink, SignedObject, StorageService, encode_name};
pub use signer::{Signer, SignerChain, SigningRequest};
