//! Managed server registry (`servers.toml`).
//!
//! Every read-modify-write runs under `registry.lock`.

use crate::constants;
use crate::core::file_lock::FileLock;
use crate::core::paths::VaultPaths;
use crate::core::vault_store;
use crate::error::{Error, Result};
use crate::models::health::HealthReport;
use crate::models::server::{RegistryFile, ServerRecord};
use crate::util::fs as vault_fs;
use std::fs;
use std::net::IpAddr;

pub struct Registry<'a> {
    paths: &'a VaultPaths,
}

impl<'a> Registry<'a> {
    pub fn new(paths: &'a VaultPaths) -> Self {
        Self { paths }
    }

    fn load(&self) -> Result<RegistryFile> {
        match fs::read_to_string(&self.paths.servers) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                Error::Registry(format!("parse {}: {}", self.paths.servers.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(Error::io_context(
                e,
                format!("read {}", self.paths.servers.display()),
            )),
        }
    }

    fn save(&self, file: &RegistryFile) -> Result<()> {
        let content = toml::to_string_pretty(file)?;
        vault_fs::write_atomic(
            &self.paths.servers,
            content.as_bytes(),
            constants::SECRET_FILE_MODE,
            true,
        )
    }

    fn update<T>(&self, f: impl FnOnce(&mut RegistryFile) -> Result<T>) -> Result<T> {
        let _lock = FileLock::exclusive(&self.paths.registry_lock)?;
        let mut file = self.load()?;
        let out = f(&mut file)?;
        self.save(&file)?;
        Ok(out)
    }

    pub fn list(&self) -> Result<Vec<ServerRecord>> {
        let mut servers = self.load()?.servers;
        servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(servers)
    }

    pub fn get(&self, hostname: &str) -> Result<ServerRecord> {
        self.load()?
            .servers
            .into_iter()
            .find(|s| s.hostname == hostname)
            .ok_or_else(|| Error::Registry(format!("unknown server '{}'", hostname)))
    }

    /// Resolve hostnames to records. An empty list means every server.
    pub fn select(&self, hostnames: &[String]) -> Result<Vec<ServerRecord>> {
        if hostnames.is_empty() {
            return self.list();
        }
        let all = self.load()?.servers;
        hostnames
            .iter()
            .map(|h| {
                all.iter()
                    .find(|s| &s.hostname == h)
                    .cloned()
                    .ok_or_else(|| Error::Registry(format!("unknown server '{}'", h)))
            })
            .collect()
    }

    pub fn add(&self, record: ServerRecord) -> Result<ServerRecord> {
        vault_store::validate_server(&record.hostname)?;
        validate_address(&record.ip)?;
        vault_store::validate_principal(&record.admin_principal)?;
        if record.ssh_port == 0 {
            return Err(Error::Registry("ssh port cannot be 0".into()));
        }
        self.update(|file| {
            if file.servers.iter().any(|s| s.hostname == record.hostname) {
                return Err(Error::Registry(format!(
                    "server '{}' already registered",
                    record.hostname
                )));
            }
            file.servers.push(record.clone());
            file.servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
            Ok(record)
        })
    }

    /// Remove a record. Vault pointers are orphaned by the caller.
    pub fn remove(&self, hostname: &str) -> Result<ServerRecord> {
        self.update(|file| {
            let idx = file
                .servers
                .iter()
                .position(|s| s.hostname == hostname)
                .ok_or_else(|| Error::Registry(format!("unknown server '{}'", hostname)))?;
            Ok(file.servers.remove(idx))
        })
    }

    /// Store the outcome of health runs. Reports for unknown hosts are ignored.
    pub fn record_health<'r>(
        &self,
        reports: impl IntoIterator<Item = &'r HealthReport>,
    ) -> Result<()> {
        let reports: Vec<&HealthReport> = reports.into_iter().collect();
        if reports.is_empty() {
            return Ok(());
        }
        self.update(|file| {
            for report in reports {
                if let Some(server) = file.servers.iter_mut().find(|s| s.hostname == report.server()) {
                    server.last_status = Some(report.status());
                    server.last_checked = Some(report.timestamp());
                }
            }
            Ok(())
        })
    }
}

/// SSH/ping destination: empty (use the hostname), an IP literal, or a
/// DNS name. Never anything the client could parse as an option.
pub fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() || address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    vault_store::validate_server(address).map_err(|_| Error::InvalidName {
        kind: "address",
        value: address.to_string(),
        reason: "expected an IP address or a [A-Za-z0-9.-] hostname".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::health::{CheckKind, CheckResult, HostStatus};
    use tempfile::TempDir;

    fn paths() -> (TempDir, VaultPaths) {
        let dir = TempDir::new().unwrap();
        let paths = VaultPaths::from_root(dir.path().to_path_buf());
        (dir, paths)
    }

    #[test]
    fn test_add_list_get() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        reg.add(ServerRecord::new("web02", "10.0.0.2", 22, "fleetadmin")).unwrap();
        reg.add(ServerRecord::new("web01", "10.0.0.1", 2222, "fleetadmin")).unwrap();

        let names: Vec<_> = reg.list().unwrap().into_iter().map(|s| s.hostname).collect();
        assert_eq!(names, vec!["web01", "web02"]);
        assert_eq!(reg.get("web01").unwrap().ssh_port, 2222);
        assert!(matches!(reg.get("nope"), Err(Error::Registry(_))));
        #[cfg(unix)]
        assert_eq!(vault_fs::mode_of(&paths.servers), Some(0o600));
    }

    #[test]
    fn test_duplicate_rejected() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        reg.add(ServerRecord::new("web01", "10.0.0.1", 22, "fleetadmin")).unwrap();
        let err = reg
            .add(ServerRecord::new("web01", "10.0.0.9", 22, "fleetadmin"))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        assert!(matches!(
            reg.add(ServerRecord::new("web_01", "", 22, "fleetadmin")),
            Err(Error::InvalidName { .. })
        ));
        assert!(matches!(
            reg.add(ServerRecord::new("web01", "", 22, "Admin")),
            Err(Error::InvalidName { .. })
        ));
    }

    #[test]
    fn test_option_like_address_rejected() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        for bad in ["-oProxyCommand=touch /tmp/x", "-p2222", "10.0.0.1 -v", "host;id"] {
            assert!(
                matches!(
                    reg.add(ServerRecord::new("web01", bad, 22, "fleetadmin")),
                    Err(Error::InvalidName { kind: "address", .. })
                ),
                "accepted {:?}",
                bad
            );
        }
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn test_address_forms_accepted() {
        for ok in ["", "10.0.0.1", "fe80::1", "db01.internal.example"] {
            assert!(validate_address(ok).is_ok(), "rejected {:?}", ok);
        }
    }

    #[test]
    fn test_remove() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        reg.add(ServerRecord::new("web01", "10.0.0.1", 22, "fleetadmin")).unwrap();
        let removed = reg.remove("web01").unwrap();
        assert_eq!(removed.ip, "10.0.0.1");
        assert!(reg.list().unwrap().is_empty());
        assert!(reg.remove("web01").is_err());
    }

    #[test]
    fn test_select() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        reg.add(ServerRecord::new("a", "", 22, "fleetadmin")).unwrap();
        reg.add(ServerRecord::new("b", "", 22, "fleetadmin")).unwrap();
        assert_eq!(reg.select(&[]).unwrap().len(), 2);
        assert_eq!(reg.select(&["b".to_string()]).unwrap()[0].hostname, "b");
        assert!(reg.select(&["c".to_string()]).is_err());
    }

    #[test]
    fn test_record_health_updates_status() {
        let (_dir, paths) = paths();
        let reg = Registry::new(&paths);
        reg.add(ServerRecord::new("web01", "", 22, "fleetadmin")).unwrap();
        assert!(reg.get("web01").unwrap().needs_recheck());

        let report = HealthReport::new(
            "web01",
            vec![
                CheckResult::passed(CheckKind::Reachability, "ok"),
                CheckResult::passed(CheckKind::SshPort, "open"),
                CheckResult::passed(CheckKind::SshAuth, "ok"),
                CheckResult::passed(CheckKind::Resources, "ok"),
            ],
        );
        let ghost = HealthReport::unavailable("ghost", "not registered");
        reg.record_health([&report, &ghost]).unwrap();

        let rec = reg.get("web01").unwrap();
        assert_eq!(rec.last_status, Some(HostStatus::Online));
        assert!(rec.last_checked.is_some());
        assert!(!rec.needs_recheck());
    }
}
