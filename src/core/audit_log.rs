//! Append-only, hash-chained audit trail of vault and fleet operations.
//!
//! One JSON object per line. `entry_hash` is SHA-256 over the canonical
//! JSON of the entry without `entry_hash`; `prev_hash` links to the line
//! before it. Entries carry metadata only, never secret material.

use crate::constants;
use crate::core::file_lock::FileLock;
use crate::core::paths::VaultPaths;
use crate::error::{Error, Result};
use crate::util::{fs as vault_fs, journald};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
}

/// What happened, before the chain fields are filled in.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub actor: String,
    pub server: Option<String>,
    pub principal: Option<String>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: &str, actor: &str) -> Self {
        Self {
            action: action.to_string(),
            actor: actor.to_string(),
            server: None,
            principal: None,
            detail: None,
        }
    }

    pub fn server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn principal(mut self, principal: &str) -> Self {
        self.principal = Some(principal.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Local operator identity, as seen through sudo.
pub fn detect_actor() -> String {
    if let Ok(user) = std::env::var("SUDO_USER") {
        if !user.is_empty() {
            return format!("{}(sudo)", user);
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Append one event with its outcome. With `forward`, also send it to journald.
pub fn record(
    paths: &VaultPaths,
    event: AuditEvent,
    outcome: std::result::Result<(), String>,
    forward: bool,
) -> Result<AuditEntry> {
    let _lock = FileLock::exclusive(&paths.audit_lock)?;
    let prev_hash = last_line_hash(&paths.audit_log)?;

    let (success, error) = match outcome {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e)),
    };
    let mut entry = AuditEntry {
        timestamp: Utc::now(),
        action: event.action,
        actor: event.actor,
        server: event.server,
        principal: event.principal,
        detail: event.detail,
        result: AuditResult { success, error },
        prev_hash,
        entry_hash: None,
    };
    entry.entry_hash = Some(compute_entry_hash(&entry)?);

    let line = serde_json::to_string(&entry)?;
    append_line(&paths.audit_log, &line)?;

    if forward {
        journald::forward_entry(&entry);
    }
    Ok(entry)
}

fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let mut value = serde_json::to_value(entry)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("entry_hash");
    }
    let canonical = serde_json::to_string(&canonicalize_value(&value))?;
    Ok(format!("{:064x}", Sha256::digest(canonical.as_bytes())))
}

/// Recursively sort object keys.
fn canonicalize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize_value(&map[k]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_value).collect())
        }
        other => other.clone(),
    }
}

fn append_line(audit_path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .map_err(|e| Error::io_context(e, format!("open audit log {}", audit_path.display())))?;
    writeln!(file, "{}", line).map_err(|e| Error::io_context(e, "write audit entry"))?;
    vault_fs::set_permissions(audit_path, constants::AUDIT_LOG_MODE)
}

/// `entry_hash` of the last non-empty line, reading backwards in chunks.
fn last_line_hash(path: &Path) -> Result<Option<String>> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io_context(e, format!("open {}", path.display()))),
    };
    let len = file
        .metadata()
        .map_err(|e| Error::io_context(e, format!("stat {}", path.display())))?
        .len();

    const CHUNK: u64 = 8192;
    let mut offset = len;
    let mut buf = Vec::new();

    while offset > 0 {
        let read_size = std::cmp::min(CHUNK, offset);
        offset -= read_size;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io_context(e, format!("seek {}", path.display())))?;
        let mut tmp = vec![0u8; read_size as usize];
        file.read_exact(&mut tmp)
            .map_err(|e| Error::io_context(e, format!("read {}", path.display())))?;
        buf.splice(0..0, tmp);

        let complete = buf
            .split(|b| *b == b'\n')
            .filter(|l| !l.iter().all(|b| b.is_ascii_whitespace()))
            .count()
            > 1;
        if complete || offset == 0 {
            for line in buf.split(|b| *b == b'\n').rev() {
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                if let Ok(entry) = serde_json::from_slice::<AuditEntry>(line) {
                    if let Some(hash) = entry.entry_hash {
                        return Ok(Some(hash));
                    }
                }
                // unparseable tail line: chain to its raw digest
                return Ok(Some(format!("{:064x}", Sha256::digest(line))));
            }
            return Ok(None);
        }
    }
    Ok(None)
}

/// Read entries, oldest first. `limit` keeps only the newest N.
pub fn read_log(paths: &VaultPaths, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
    let file = match fs::File::open(&paths.audit_log) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::io_context(
                e,
                format!("open audit log {}", paths.audit_log.display()),
            ))
        }
    };

    let mut entries = Vec::new();
    let mut malformed = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io_context(e, "read audit log line"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(trimmed) {
            Ok(entry) => entries.push(entry),
            Err(_) => malformed += 1,
        }
    }
    if malformed > 0 {
        tracing::warn!(malformed, "malformed audit entries skipped");
    }

    if let Some(limit) = limit {
        if entries.len() > limit {
            entries = entries.split_off(entries.len() - limit);
        }
    }
    Ok(entries)
}

/// Verify hashes and links. Returns (entries checked, problems found).
pub fn verify_chain(paths: &VaultPaths) -> Result<(usize, Vec<String>)> {
    let entries = read_log(paths, None)?;
    let mut errors = Vec::new();
    let mut prev: Option<String> = None;

    for (i, entry) in entries.iter().enumerate() {
        if i > 0 && entry.prev_hash != prev {
            errors.push(format!(
                "entry {}: prev_hash mismatch (expected {:?}, got {:?})",
                i + 1,
                prev,
                entry.prev_hash
            ));
        }
        match (&entry.entry_hash, compute_entry_hash(entry)) {
            (Some(stored), Ok(computed)) if *stored != computed => {
                errors.push(format!("entry {}: entry_hash mismatch (tampered?)", i + 1));
            }
            (None, _) => errors.push(format!("entry {}: missing entry_hash", i + 1)),
            (_, Err(e)) => errors.push(format!("entry {}: cannot compute hash: {}", i + 1, e)),
            _ => {}
        }
        prev = entry.entry_hash.clone();
    }
    Ok((entries.len(), errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_paths() -> (TempDir, VaultPaths) {
        let dir = TempDir::new().unwrap();
        let paths = VaultPaths::from_root(dir.path().to_path_buf());
        (dir, paths)
    }

    fn ok(paths: &VaultPaths, action: &str) -> AuditEntry {
        record(
            paths,
            AuditEvent::new(action, "tester").server("web01").principal("deploy"),
            Ok(()),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_record_and_read() {
        let (_dir, paths) = test_paths();
        ok(&paths, "create-secret");
        let entries = read_log(&paths, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "create-secret");
        assert_eq!(entries[0].server.as_deref(), Some("web01"));
        assert!(entries[0].result.success);
        assert!(entries[0].prev_hash.is_none());
        assert!(entries[0].entry_hash.is_some());
    }

    #[test]
    fn test_failure_outcome_recorded() {
        let (_dir, paths) = test_paths();
        let entry = record(
            &paths,
            AuditEvent::new("provision", "tester").server("web02").detail("step install_key"),
            Err("auth rejected".into()),
            false,
        )
        .unwrap();
        assert!(!entry.result.success);
        assert_eq!(entry.result.error.as_deref(), Some("auth rejected"));
    }

    #[test]
    fn test_chain_links_entries() {
        let (_dir, paths) = test_paths();
        let first = ok(&paths, "create-secret");
        let second = ok(&paths, "rotate-secret");
        assert_eq!(second.prev_hash, first.entry_hash);
    }

    #[test]
    fn test_read_log_with_limit() {
        let (_dir, paths) = test_paths();
        for i in 0..5 {
            ok(&paths, &format!("action_{}", i));
        }
        let entries = read_log(&paths, Some(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, "action_4");
    }

    #[test]
    fn test_read_log_nonexistent() {
        let (_dir, paths) = test_paths();
        assert!(read_log(&paths, None).unwrap().is_empty());
    }

    #[test]
    fn test_canonical_json_deterministic() {
        let c1 = canonicalize_value(&serde_json::json!({"b": 1, "a": 2}));
        let c2 = canonicalize_value(&serde_json::json!({"a": 2, "b": 1}));
        let s1 = serde_json::to_string(&c1).unwrap();
        assert_eq!(s1, serde_json::to_string(&c2).unwrap());
        assert_eq!(s1, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_verify_chain_ok() {
        let (_dir, paths) = test_paths();
        for action in ["create-secret", "rotate-secret", "server-remove"] {
            ok(&paths, action);
        }
        let (total, errors) = verify_chain(&paths).unwrap();
        assert_eq!(total, 3);
        assert!(errors.is_empty(), "errors: {:?}", errors);
    }

    #[test]
    fn test_verify_chain_detects_tamper() {
        let (_dir, paths) = test_paths();
        ok(&paths, "create-secret");
        ok(&paths, "rotate-secret");

        let content = fs::read_to_string(&paths.audit_log).unwrap();
        fs::write(&paths.audit_log, content.replace("rotate-secret", "retrieve-secret")).unwrap();

        let (total, errors) = verify_chain(&paths).unwrap();
        assert_eq!(total, 2);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_verify_chain_detects_deleted_line() {
        let (_dir, paths) = test_paths();
        for action in ["a", "b", "c"] {
            ok(&paths, action);
        }
        let content = fs::read_to_string(&paths.audit_log).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(&paths.audit_log, kept.join("\n") + "\n").unwrap();

        let (_, errors) = verify_chain(&paths).unwrap();
        assert!(errors.iter().any(|e| e.contains("prev_hash mismatch")));
    }

    #[test]
    fn test_last_hash_found_across_chunks() {
        let (_dir, paths) = test_paths();
        let long = "x".repeat(10_000);
        record(&paths, AuditEvent::new("a", "t").detail(long.clone()), Ok(()), false).unwrap();
        let second =
            record(&paths, AuditEvent::new("b", "t").detail(long), Ok(()), false).unwrap();
        assert_eq!(
            last_line_hash(&paths.audit_log).unwrap(),
            second.entry_hash
        );
    }
}
