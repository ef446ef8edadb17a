//! Load and save `fleet-vault.toml`.

use crate::constants;
use crate::core::paths::VaultPaths;
use crate::error::{Error, Result};
use crate::models::vault_config::VaultFile;
use crate::util::fs as vault_fs;
use std::fs;
use std::path::{Path, PathBuf};

/// Load the config, falling back to defaults when the file is absent.
pub fn load(path: &Path) -> Result<VaultFile> {
    if !path.exists() {
        return Ok(VaultFile::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| Error::io_context(e, format!("read config {}", path.display())))?;
    let mut config: VaultFile = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    if config.vault.version == 0 {
        config.vault.version = 1;
    }
    validate(&config)?;
    Ok(config)
}

pub fn save(path: &Path, config: &VaultFile) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io_context(e, format!("create dir {}", parent.display())))?;
    }
    vault_fs::write_atomic(path, content.as_bytes(), constants::SECRET_FILE_MODE, true)
}

pub fn validate(config: &VaultFile) -> Result<()> {
    if config.fleet.max_concurrency == 0 {
        return Err(Error::Config("fleet.max_concurrency must be at least 1".into()));
    }
    if config.policy.default_length > constants::MAX_SECRET_LENGTH {
        return Err(Error::Config(format!(
            "policy.default_length exceeds {}",
            constants::MAX_SECRET_LENGTH
        )));
    }
    if config.provisioning.reachability_attempts == 0 {
        return Err(Error::Config(
            "provisioning.reachability_attempts must be at least 1".into(),
        ));
    }
    if config.ssh.connect_timeout_secs == 0 || config.ssh.command_timeout_secs == 0 {
        return Err(Error::Config("ssh timeouts must be non-zero".into()));
    }
    Ok(())
}

/// Master key location: the configured override, else `<root>/master.key`.
pub fn master_key_path(paths: &VaultPaths, config: &VaultFile) -> PathBuf {
    match &config.vault.master_key_path {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => paths.root.join(p),
        None => paths.master_key.clone(),
    }
}
