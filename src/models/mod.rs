//! Data structures shared across the vault and fleet layers.

pub mod health;
pub mod policy;
pub mod provisioning;
pub mod secret;
pub mod server;
pub mod vault_config;
