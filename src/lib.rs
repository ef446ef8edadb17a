//! Credential vault and SSH provisioning for a small server fleet.
//!
//! Stores versioned per-(server, principal) secrets encrypted under one
//! master key, probes host health over SSH, and provisions key-based admin
//! access, fanning out across hosts with bounded concurrency.
//!
//! ## Modules
//! - `api` — Authorized, audited operations (`FleetManager`)
//! - `cli` — Command-line handlers
//! - `core` — Vault business logic (codec, store, registry, audit)
//! - `fleet` — SSH execution, health probes, provisioning, fan-out
//! - `models` — Data structures
//! - `util` — Filesystem and journald helpers

pub mod api;
pub mod cli;
pub mod constants;
pub mod core;
pub mod error;
pub mod fleet;
pub mod models;
pub mod util;

pub use error::{Error, Result};
