//! Vault entry and version metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk envelope format.
pub const ENTRY_FORMAT: u32 = 1;

/// One immutable encrypted secret snapshot as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    #[serde(default = "default_format")]
    pub format: u32,
    pub server: String,
    pub principal: String,
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    /// Base64 of the codec blob.
    pub ciphertext: String,
}

impl VaultEntry {
    /// Metadata view without the ciphertext.
    pub fn meta(&self, current: bool) -> VersionMeta {
        VersionMeta {
            server: self.server.clone(),
            principal: self.principal.clone(),
            version_id: self.version_id.clone(),
            created_at: self.created_at,
            current,
        }
    }
}

/// Audit-safe description of one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub server: String,
    pub principal: String,
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub current: bool,
}

/// A live (server, principal) pair and its current version.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentSecret {
    pub server: String,
    pub principal: String,
    pub version_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub versions: usize,
}

fn default_format() -> u32 {
    ENTRY_FORMAT
}
