//! Vault path resolution and directory structure.

use crate::constants;
use crate::error::{Error, Result};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub root: PathBuf,
    /// Encrypted entries and pointer records.
    pub vault: PathBuf,
    /// Per-(server, principal) lock files.
    pub locks: PathBuf,
    pub config: PathBuf,
    pub master_key: PathBuf,
    pub servers: PathBuf,
    pub registry_lock: PathBuf,
    pub audit_log: PathBuf,
    pub audit_lock: PathBuf,
}

impl VaultPaths {
    /// Resolve vault paths from CLI arg, env var, or auto-detection.
    pub fn resolve(root_arg: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = root_arg {
            return Ok(Self::from_root(root));
        }
        if let Ok(root) = env::var(constants::ROOT_ENV_VAR) {
            return Ok(Self::from_root(PathBuf::from(root)));
        }
        if let Some(found) = find_vault_root()? {
            return Ok(Self::from_root(found));
        }
        Ok(Self::from_root(PathBuf::from(constants::DEFAULT_VAULT_ROOT)))
    }

    /// Create vault paths from a root directory.
    pub fn from_root(root: PathBuf) -> Self {
        Self {
            vault: root.join("vault"),
            locks: root.join("locks"),
            config: root.join(constants::CONFIG_FILE),
            master_key: root.join(constants::MASTER_KEY_FILE),
            servers: root.join("servers.toml"),
            registry_lock: root.join("registry.lock"),
            audit_log: root.join("audit.log"),
            audit_lock: root.join("audit.lock"),
            root,
        }
    }

    /// Encrypted entry file for one version.
    pub fn entry_file(&self, server: &str, principal: &str, version_id: &str) -> PathBuf {
        self.vault.join(format!(
            "{}_{}_{}{}",
            server,
            principal,
            version_id,
            constants::ENTRY_EXTENSION
        ))
    }

    pub fn current_pointer(&self, server: &str, principal: &str) -> PathBuf {
        self.vault
            .join(format!("{}_{}{}", server, principal, constants::CURRENT_SUFFIX))
    }

    pub fn orphaned_pointer(&self, server: &str, principal: &str) -> PathBuf {
        self.vault
            .join(format!("{}_{}{}", server, principal, constants::ORPHANED_SUFFIX))
    }

    pub fn key_lock(&self, server: &str, principal: &str) -> PathBuf {
        self.locks.join(format!("{}_{}.lock", server, principal))
    }
}

fn find_vault_root() -> Result<Option<PathBuf>> {
    let cwd = env::current_dir().map_err(|e| Error::io_context(e, "resolve current directory"))?;
    for ancestor in cwd.ancestors() {
        if looks_like_root(ancestor) {
            return Ok(Some(ancestor.to_path_buf()));
        }
    }
    Ok(None)
}

fn looks_like_root(path: &Path) -> bool {
    path.join("vault").is_dir() && path.join(constants::CONFIG_FILE).is_file()
}

impl std::fmt::Display for VaultPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vault@{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_root() {
        let paths = VaultPaths::from_root(PathBuf::from("/test"));
        assert_eq!(paths.root, PathBuf::from("/test"));
        assert_eq!(paths.vault, PathBuf::from("/test/vault"));
        assert_eq!(paths.locks, PathBuf::from("/test/locks"));
        assert_eq!(paths.config, PathBuf::from("/test/fleet-vault.toml"));
        assert_eq!(paths.master_key, PathBuf::from("/test/master.key"));
        assert_eq!(paths.servers, PathBuf::from("/test/servers.toml"));
        assert_eq!(paths.audit_log, PathBuf::from("/test/audit.log"));
    }

    #[test]
    fn test_record_names() {
        let paths = VaultPaths::from_root(PathBuf::from("/v"));
        assert_eq!(
            paths.entry_file("web01", "deploy", "20260101T000000000000000Z"),
            PathBuf::from("/v/vault/web01_deploy_20260101T000000000000000Z.vault")
        );
        assert_eq!(
            paths.current_pointer("web01", "deploy"),
            PathBuf::from("/v/vault/web01_deploy_current")
        );
        assert_eq!(
            paths.orphaned_pointer("web01", "deploy"),
            PathBuf::from("/v/vault/web01_deploy_orphaned")
        );
        assert_eq!(
            paths.key_lock("web01", "deploy"),
            PathBuf::from("/v/locks/web01_deploy.lock")
        );
    }
}
