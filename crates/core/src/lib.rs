//! Core logic for the Abacus file service.
//!
//! This crate has ZERO web framework dependencies. It owns the object storage
//! facade: conflict-checked uploads, encoded listings, signed download links
//! and idempotent deletes against a single container.
//!
//! # Modules
//!
//! - `storage` - Storage facade, SAS signing and backend wiring

pub mod storage;
