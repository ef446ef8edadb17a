//! Error taxonomy shared by the vault and fleet layers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for fleet-vault operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Host unreachable or port closed.
    #[error("cannot connect to {host}: {message}")]
    Connect { host: String, message: String },

    /// Credential rejected by the remote host.
    #[error("authentication as {principal}@{host} rejected: {message}")]
    Auth {
        host: String,
        principal: String,
        message: String,
    },

    /// Operation exceeded its bound and was abandoned.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// Vault entry unreadable, tampered with, or encrypted under another key.
    #[error("cannot decrypt vault entry: {0}")]
    Decrypt(String),

    /// Requested secret violates the length/complexity policy.
    #[error("policy: {0}")]
    Policy(String),

    /// No current secret for the (server, principal) pair.
    #[error("no current secret for {principal}@{server}")]
    NotFound { server: String, principal: String },

    /// A provisioning step failed after retries.
    #[error("provisioning {host} failed at {step}: {message}")]
    Provisioning {
        host: String,
        step: String,
        message: String,
    },

    /// The caller-supplied authorization decision denies the operation.
    #[error("actor '{actor}' is not authorized to {action}")]
    Unauthorized { actor: String, action: String },

    #[error("invalid {kind} '{value}': {reason}")]
    InvalidName {
        kind: &'static str,
        value: String,
        reason: String,
    },

    /// Master key missing or unusable. Fatal at startup.
    #[error("master key {}: {message}", .path.display())]
    MasterKey { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// Network-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connect { .. } | Error::Timeout { .. })
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub(crate) fn io_context(err: std::io::Error, what: impl std::fmt::Display) -> Self {
        Error::Io(std::io::Error::new(err.kind(), format!("{}: {}", what, err)))
    }
}
