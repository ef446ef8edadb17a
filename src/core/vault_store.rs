//! Versioned, encrypted secret storage keyed by (server, principal).
//!
//! Layout under `vault/`:
//! - `{server}_{principal}_{version}.vault`: immutable JSON envelope
//! - `{server}_{principal}_current`: version id of the live entry
//! - `{server}_{principal}_orphaned`: former pointer of a removed server
//!
//! Every mutation of one pair runs under `locks/{server}_{principal}.lock`.

use crate::constants;
use crate::core::codec::{MasterKey, SecretCodec};
use crate::core::file_lock::FileLock;
use crate::core::generator;
use crate::core::paths::VaultPaths;
use crate::error::{Error, Result};
use crate::models::policy::PolicySection;
use crate::models::secret::{CurrentSecret, VaultEntry, VersionMeta, ENTRY_FORMAT};
use crate::util::fs as vault_fs;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use zeroize::Zeroizing;

/// Server names exclude `_` so record names split unambiguously.
pub fn validate_server(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind: "server",
        value: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if name.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("must start with a letter or digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(invalid("only [A-Za-z0-9.-] allowed"));
    }
    Ok(())
}

/// POSIX account names: `[a-z_][a-z0-9_.-]*`, at most 32 characters.
pub fn validate_principal(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind: "principal",
        value: name.to_string(),
        reason: reason.to_string(),
    };
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("cannot be empty")),
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        Some(_) => return Err(invalid("must start with [a-z_]")),
    }
    if name.len() > 32 {
        return Err(invalid("longer than 32 characters"));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(c)) {
        return Err(invalid("only [a-z0-9_.-] allowed"));
    }
    Ok(())
}

fn aad(server: &str, principal: &str, version_id: &str) -> Vec<u8> {
    format!("{}/{}/{}", server, principal, version_id).into_bytes()
}

/// Inverse of `format_version`: `YYYYMMDDTHHMMSSnnnnnnnnnZ`.
fn parse_version(version_id: &str) -> Option<DateTime<Utc>> {
    let fixed_digits = version_id
        .bytes()
        .enumerate()
        .all(|(i, c)| i == 8 || i == 24 || c.is_ascii_digit());
    if version_id.len() != 25 || !fixed_digits {
        return None;
    }
    NaiveDateTime::parse_from_str(version_id, constants::VERSION_FORMAT)
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

fn format_version(ts: DateTime<Utc>) -> String {
    ts.format(constants::VERSION_FORMAT).to_string()
}

/// A strictly newer version id than `latest`, normally the current time.
fn next_version(latest: Option<&str>) -> (String, DateTime<Utc>) {
    let now = Utc::now();
    let candidate = format_version(now);
    match latest {
        Some(prev) if candidate.as_str() <= prev => {
            let bumped = parse_version(prev)
                .map(|t| t + Duration::nanoseconds(1))
                .unwrap_or(now);
            (format_version(bumped), bumped)
        }
        _ => (candidate, now),
    }
}

/// File name of a record, split into (server, principal, tail).
fn split_record_name(stem: &str) -> Option<(&str, &str, &str)> {
    let (rest, tail) = stem.rsplit_once('_')?;
    let (server, principal) = rest.split_once('_')?;
    if server.is_empty() || principal.is_empty() || tail.is_empty() {
        return None;
    }
    Some((server, principal, tail))
}

pub struct VaultStore {
    paths: VaultPaths,
    codec: SecretCodec,
}

impl VaultStore {
    /// Open the store, creating `vault/` and `locks/` if needed.
    pub fn open(paths: VaultPaths, key: &MasterKey) -> Result<Self> {
        vault_fs::ensure_dir(&paths.vault, constants::VAULT_DIR_MODE)?;
        vault_fs::ensure_dir(&paths.locks, constants::LOCKS_DIR_MODE)?;
        Ok(Self {
            paths,
            codec: SecretCodec::new(key),
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Generate a secret under `policy`, store it as a new version and make it current.
    pub fn create_secret(
        &self,
        server: &str,
        principal: &str,
        length: usize,
        policy: &PolicySection,
    ) -> Result<(VaultEntry, Zeroizing<String>)> {
        validate_server(server)?;
        validate_principal(principal)?;
        let secret = generator::generate_secret(length, policy)?;
        let entry = self.commit(server, principal, secret.as_bytes())?;
        Ok((entry, secret))
    }

    /// Identical to `create_secret`; history is kept either way.
    pub fn rotate(
        &self,
        server: &str,
        principal: &str,
        length: usize,
        policy: &PolicySection,
    ) -> Result<(VaultEntry, Zeroizing<String>)> {
        self.create_secret(server, principal, length, policy)
    }

    /// Store a caller-supplied plaintext as a new current version.
    pub fn store_secret(&self, server: &str, principal: &str, plaintext: &[u8]) -> Result<VaultEntry> {
        validate_server(server)?;
        validate_principal(principal)?;
        if plaintext.is_empty() {
            return Err(Error::Policy("secret cannot be empty".into()));
        }
        if plaintext.len() > constants::MAX_SECRET_SIZE {
            return Err(Error::Policy(format!(
                "secret exceeds {} bytes",
                constants::MAX_SECRET_SIZE
            )));
        }
        self.commit(server, principal, plaintext)
    }

    /// Write the entry durably, then swap the pointer in one rename.
    fn commit(&self, server: &str, principal: &str, plaintext: &[u8]) -> Result<VaultEntry> {
        let _lock = FileLock::exclusive(&self.paths.key_lock(server, principal))?;

        let versions = self.version_ids(server, principal)?;
        let (version_id, created_at) = next_version(versions.last().map(String::as_str));

        let blob = self
            .codec
            .encrypt(plaintext, &aad(server, principal, &version_id))?;
        let entry = VaultEntry {
            format: ENTRY_FORMAT,
            server: server.to_string(),
            principal: principal.to_string(),
            version_id: version_id.clone(),
            created_at,
            ciphertext: BASE64.encode(blob),
        };
        let body = serde_json::to_vec_pretty(&entry)?;
        vault_fs::write_atomic(
            &self.paths.entry_file(server, principal, &version_id),
            &body,
            constants::SECRET_FILE_MODE,
            false,
        )?;

        let mut pointer = version_id.clone();
        pointer.push('\n');
        vault_fs::write_atomic(
            &self.paths.current_pointer(server, principal),
            pointer.as_bytes(),
            constants::SECRET_FILE_MODE,
            true,
        )?;

        tracing::info!(server, principal, version = %version_id, "secret version committed");
        Ok(entry)
    }

    /// Version id the current pointer names, if any.
    pub fn current_version(&self, server: &str, principal: &str) -> Result<Option<String>> {
        read_pointer(&self.paths.current_pointer(server, principal))
    }

    /// Decrypt the live secret. Never returns partial plaintext.
    pub fn get_current(&self, server: &str, principal: &str) -> Result<Zeroizing<Vec<u8>>> {
        validate_server(server)?;
        validate_principal(principal)?;
        let version_id =
            self.current_version(server, principal)?
                .ok_or_else(|| Error::NotFound {
                    server: server.to_string(),
                    principal: principal.to_string(),
                })?;
        self.decrypt_version(server, principal, &version_id)
    }

    /// Decrypt one specific version.
    pub fn decrypt_version(
        &self,
        server: &str,
        principal: &str,
        version_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let entry = self.read_entry(server, principal, version_id)?;
        let blob = BASE64
            .decode(entry.ciphertext.as_bytes())
            .map_err(|e| Error::Decrypt(format!("ciphertext is not base64: {}", e)))?;
        self.codec.decrypt(&blob, &aad(server, principal, version_id))
    }

    fn read_entry(&self, server: &str, principal: &str, version_id: &str) -> Result<VaultEntry> {
        let path = self.paths.entry_file(server, principal, version_id);
        let body = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::Decrypt(format!(
                    "entry {} referenced by pointer is missing",
                    version_id
                )))
            }
            Err(e) => return Err(Error::io_context(e, format!("read {}", path.display()))),
        };
        let entry: VaultEntry = serde_json::from_slice(&body)
            .map_err(|e| Error::Decrypt(format!("{}: malformed envelope: {}", path.display(), e)))?;
        if entry.server != server || entry.principal != principal || entry.version_id != version_id {
            return Err(Error::Decrypt(format!(
                "{}: envelope does not match its file name",
                path.display()
            )));
        }
        Ok(entry)
    }

    /// Version metadata for one pair, oldest first. Reads names only.
    pub fn list_history(&self, server: &str, principal: &str) -> Result<Vec<VersionMeta>> {
        validate_server(server)?;
        validate_principal(principal)?;
        let current = self.current_version(server, principal)?;
        Ok(self
            .version_ids(server, principal)?
            .into_iter()
            .map(|version_id| meta_for(server, principal, &version_id, current.as_deref()))
            .collect())
    }

    /// History of every principal on `server`, grouped by principal.
    pub fn list_server_history(&self, server: &str) -> Result<Vec<VersionMeta>> {
        validate_server(server)?;
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (s, principal, version_id) in self.scan_entries(&format!("{}_*", server))? {
            if s == server {
                grouped.entry(principal).or_default().push(version_id);
            }
        }
        let mut out = Vec::new();
        for (principal, mut versions) in grouped {
            versions.sort();
            let current = self.current_version(server, &principal)?;
            out.extend(
                versions
                    .iter()
                    .map(|v| meta_for(server, &principal, v, current.as_deref())),
            );
        }
        Ok(out)
    }

    /// Every pair with a live pointer, sorted by server then principal.
    pub fn list_current(&self) -> Result<Vec<CurrentSecret>> {
        let mut counts: BTreeMap<(String, String), usize> = BTreeMap::new();
        for (server, principal, _) in self.scan_entries("*")? {
            *counts.entry((server, principal)).or_default() += 1;
        }

        let mut out = Vec::new();
        for (server, principal) in self.scan_pointers("*", constants::CURRENT_SUFFIX)? {
            let Some(version_id) = self.current_version(&server, &principal)? else {
                continue;
            };
            let versions = counts
                .get(&(server.clone(), principal.clone()))
                .copied()
                .unwrap_or(0);
            out.push(CurrentSecret {
                created_at: parse_version(&version_id),
                server,
                principal,
                version_id,
                versions,
            });
        }
        out.sort_by(|a, b| (&a.server, &a.principal).cmp(&(&b.server, &b.principal)));
        Ok(out)
    }

    /// Retire every live pointer of `server`. Entries stay for audit.
    ///
    /// Returns the principals whose pointers were orphaned.
    pub fn orphan_server(&self, server: &str) -> Result<Vec<String>> {
        validate_server(server)?;
        let mut orphaned = Vec::new();
        for (s, principal) in
            self.scan_pointers(&format!("{}_*", server), constants::CURRENT_SUFFIX)?
        {
            if s != server {
                continue;
            }
            let _lock = FileLock::exclusive(&self.paths.key_lock(server, &principal))?;
            let from = self.paths.current_pointer(server, &principal);
            let to = self.paths.orphaned_pointer(server, &principal);
            match fs::rename(&from, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::io_context(e, format!("orphan {}", from.display())))
                }
            }
            tracing::info!(server, principal = %principal, "current pointer orphaned");
            orphaned.push(principal);
        }
        Ok(orphaned)
    }

    /// Sorted version ids for one pair.
    fn version_ids(&self, server: &str, principal: &str) -> Result<Vec<String>> {
        let mut versions: Vec<String> = self
            .scan_entries(&format!("{}_{}_*", server, principal))?
            .into_iter()
            .filter(|(s, p, _)| s == server && p == principal)
            .map(|(_, _, v)| v)
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// Entry files matching `prefix_glob` + extension, parsed into parts.
    fn scan_entries(&self, prefix_glob: &str) -> Result<Vec<(String, String, String)>> {
        let mut out = Vec::new();
        for path in self.glob(&format!("{}{}", prefix_glob, constants::ENTRY_EXTENSION))? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(constants::ENTRY_EXTENSION) else {
                continue;
            };
            if let Some((server, principal, version)) = split_record_name(stem) {
                if parse_version(version).is_some() {
                    out.push((server.to_string(), principal.to_string(), version.to_string()));
                }
            }
        }
        Ok(out)
    }

    fn scan_pointers(&self, prefix_glob: &str, suffix: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for path in self.glob(&format!("{}{}", prefix_glob, suffix))? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(suffix) else {
                continue;
            };
            if let Some((server, principal)) = stem.split_once('_') {
                if !server.is_empty() && !principal.is_empty() {
                    out.push((server.to_string(), principal.to_string()));
                }
            }
        }
        Ok(out)
    }

    fn glob(&self, file_pattern: &str) -> Result<Vec<std::path::PathBuf>> {
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&self.paths.vault.to_string_lossy()),
            file_pattern
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::io_context(std::io::Error::new(ErrorKind::InvalidInput, e.msg), "glob"))?;
        Ok(paths.filter_map(|p| p.ok()).collect())
    }
}

fn read_pointer(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => {
            let id = s.trim();
            if id.is_empty() {
                Ok(None)
            } else {
                Ok(Some(id.to_string()))
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io_context(e, format!("read pointer {}", path.display()))),
    }
}

fn meta_for(server: &str, principal: &str, version_id: &str, current: Option<&str>) -> VersionMeta {
    VersionMeta {
        server: server.to_string(),
        principal: principal.to_string(),
        version_id: version_id.to_string(),
        created_at: parse_version(version_id).unwrap_or_default(),
        current: current == Some(version_id),
    }
}
