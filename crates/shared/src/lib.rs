//! Shared errors and configuration for the Abacus file service.
//!
//! This crate provides the pieces every other crate agrees on:
//! - Application-wide error types and their HTTP status mapping
//! - Configuration management (files, environment, Azure variables)

pub mod config;
pub mod error;

pub use config::{AppConfig, LogFormat, SigningMode, StorageBackend, StorageSettings};
pub use error::AppError;
