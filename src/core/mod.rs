//! Vault business logic. Synchronous; file operations are short and run
//! inline, also from async callers.

pub mod audit_log;
pub mod codec;
pub mod config;
pub mod file_lock;
pub mod generator;
pub mod paths;
pub mod registry;
pub mod vault_store;
