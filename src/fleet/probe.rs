//! Per-host health checks.
//!
//! Four ordered checks, never short-circuited: reachability, SSH port,
//! SSH authentication, resource snapshot. Network failures become failed
//! checks; nothing here returns an error to the caller.

use crate::constants;
use crate::error::{Error, Result};
use crate::fleet::commands;
use crate::fleet::ssh::{Credential, RemoteShell, Target};
use crate::models::health::{CheckKind, CheckResult, HealthReport, ResourceSnapshot};
use crate::models::server::ServerRecord;
use crate::models::vault_config::{ResourceThresholds, VaultFile};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

/// Network-layer probes, separated from SSH so they can be substituted.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Echo request. Returns a short detail on success.
    async fn ping(&self, address: &str, timeout: Duration) -> Result<String>;

    async fn tcp_connect(&self, address: &str, port: u16, timeout: Duration) -> Result<()>;
}

/// `ping(8)` plus tokio TCP connects.
#[derive(Debug, Clone, Default)]
pub struct SystemNetworkProbe;

impl SystemNetworkProbe {
    async fn fallback_ports(&self, address: &str, timeout: Duration) -> Result<String> {
        for port in constants::FALLBACK_PROBE_PORTS {
            if self.tcp_connect(address, *port, timeout).await.is_ok() {
                return Ok(format!("ping unavailable; port {} answered", port));
            }
        }
        Err(Error::Connect {
            host: address.to_string(),
            message: "ping unavailable and no fallback port answered".into(),
        })
    }
}

#[async_trait]
impl NetworkProbe for SystemNetworkProbe {
    async fn ping(&self, address: &str, timeout: Duration) -> Result<String> {
        let wait = timeout.as_secs().max(1).to_string();
        let spawned = Command::new("ping")
            .args(["-c", "1", "-W", &wait, "--", address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(address, "ping binary missing, trying tcp ports");
                return self.fallback_ports(address, timeout).await;
            }
            Err(e) => return Err(Error::io_context(e, "spawn ping")),
        };

        // ping -W bounds the wait for a reply, not name resolution
        let limit = timeout + Duration::from_secs(1);
        let status = tokio::time::timeout(limit, child.wait())
            .await
            .map_err(|_| Error::timeout(format!("ping {}", address), limit))?
            .map_err(|e| Error::io_context(e, "wait for ping"))?;
        if status.success() {
            Ok("echo reply received".into())
        } else {
            Err(Error::Connect {
                host: address.to_string(),
                message: "no echo reply".into(),
            })
        }
    }

    async fn tcp_connect(&self, address: &str, port: u16, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Error::Connect {
                host: address.to_string(),
                message: format!("port {}: {}", port, e),
            }),
            Err(_) => Err(Error::timeout(format!("connect {}:{}", address, port), timeout)),
        }
    }
}

/// Settings shared by every probe of one run.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub principal: String,
    pub credential: Credential,
    pub ping_timeout: Duration,
    pub port_timeout: Duration,
    pub command_timeout: Duration,
    pub thresholds: Option<ResourceThresholds>,
}

impl ProbeSettings {
    pub fn from_config(config: &VaultFile) -> Self {
        Self {
            principal: config.ssh.operator_principal.clone(),
            credential: Credential::from_identity(config.ssh.identity_file.as_deref()),
            ping_timeout: Duration::from_secs(config.health.ping_timeout_secs),
            port_timeout: Duration::from_secs(config.health.port_timeout_secs),
            command_timeout: config.ssh.command_timeout(),
            thresholds: config.health.thresholds.clone(),
        }
    }
}

pub struct HealthProbe {
    shell: Arc<dyn RemoteShell>,
    network: Arc<dyn NetworkProbe>,
    settings: ProbeSettings,
}

impl HealthProbe {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        network: Arc<dyn NetworkProbe>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            shell,
            network,
            settings,
        }
    }

    pub async fn probe(&self, server: &ServerRecord) -> HealthReport {
        let address = server.address();
        let s = &self.settings;

        let reachability = match self.network.ping(address, s.ping_timeout).await {
            Ok(detail) => CheckResult::passed(CheckKind::Reachability, detail),
            Err(e) => CheckResult::failed(CheckKind::Reachability, e.to_string()),
        };

        let port = match self
            .network
            .tcp_connect(address, server.ssh_port, s.port_timeout)
            .await
        {
            Ok(()) => CheckResult::passed(CheckKind::SshPort, format!("port {} open", server.ssh_port)),
            Err(e) => CheckResult::failed(CheckKind::SshPort, e.to_string()),
        };

        let (auth, resources) = self.probe_session(server).await;

        let report = HealthReport::new(
            server.hostname.clone(),
            vec![reachability, port, auth, resources],
        );
        tracing::info!(host = %server.hostname, status = %report.status(), "health probe finished");
        report
    }

    /// Checks 3 and 4. Check 4 is skipped unless check 3 passed.
    async fn probe_session(&self, server: &ServerRecord) -> (CheckResult, CheckResult) {
        let s = &self.settings;
        let target = Target::new(&server.hostname, server.address(), server.ssh_port, &s.principal);

        let session = match self.shell.connect(&target, &s.credential).await {
            Ok(session) => session,
            Err(e) => {
                return (
                    CheckResult::failed(CheckKind::SshAuth, e.to_string()),
                    CheckResult::skipped(CheckKind::Resources, "ssh authentication failed"),
                )
            }
        };

        let auth = match self.shell.run(&session, commands::WHOAMI, s.command_timeout).await {
            Ok(out) if out.success() && out.stdout.trim() == s.principal => {
                CheckResult::passed(CheckKind::SshAuth, format!("authenticated as {}", s.principal))
            }
            Ok(out) if out.success() => CheckResult::failed(
                CheckKind::SshAuth,
                format!("expected {}, logged in as {}", s.principal, out.stdout.trim()),
            ),
            Ok(out) => CheckResult::failed(CheckKind::SshAuth, out.summary()),
            Err(e) => CheckResult::failed(CheckKind::SshAuth, e.to_string()),
        };

        let resources = if auth.is_passed() {
            self.resource_check(&session).await
        } else {
            CheckResult::skipped(CheckKind::Resources, "ssh authentication failed")
        };

        self.shell.close(session).await;
        (auth, resources)
    }

    async fn resource_check(&self, session: &crate::fleet::ssh::Session) -> CheckResult {
        let out = match self
            .shell
            .run(session, constants::RESOURCE_SNAPSHOT_COMMAND, self.settings.command_timeout)
            .await
        {
            Ok(out) if out.success() => out,
            Ok(out) => return CheckResult::failed(CheckKind::Resources, out.summary()),
            Err(e) => return CheckResult::failed(CheckKind::Resources, e.to_string()),
        };
        let Some(snapshot) = commands::parse_resource_snapshot(&out.stdout) else {
            return CheckResult::failed(CheckKind::Resources, "unparseable resource output");
        };
        match self.settings.thresholds.as_ref().and_then(|t| exceeded(&snapshot, t)) {
            Some(why) => CheckResult::failed(CheckKind::Resources, format!("{} ({})", snapshot, why)),
            None => CheckResult::passed(CheckKind::Resources, snapshot.to_string()),
        }
    }
}

/// First configured threshold the snapshot exceeds.
fn exceeded(snapshot: &ResourceSnapshot, t: &ResourceThresholds) -> Option<String> {
    if let Some(max) = t.max_load_per_cpu {
        if snapshot.load_per_cpu() > max {
            return Some(format!("load per cpu above {}", max));
        }
    }
    if let Some(max) = t.max_memory_percent {
        if snapshot.memory_percent > max {
            return Some(format!("memory above {}%", max));
        }
    }
    if let Some(max) = t.max_disk_percent {
        if snapshot.disk_percent > max {
            return Some(format!("disk above {}%", max));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::FakeHost;
    use crate::models::health::{CheckStatus, HostStatus};

    fn settings(principal: &str) -> ProbeSettings {
        ProbeSettings {
            principal: principal.to_string(),
            credential: Credential::Agent,
            ping_timeout: Duration::from_secs(1),
            port_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(5),
            thresholds: None,
        }
    }

    fn probe_for(host: &Arc<FakeHost>, settings: ProbeSettings) -> HealthProbe {
        HealthProbe::new(host.clone(), host.clone(), settings)
    }

    fn server() -> ServerRecord {
        ServerRecord::new("web01", "10.0.0.1", 22, "fleetadmin")
    }

    #[tokio::test]
    async fn test_all_checks_pass_online() {
        let host = Arc::new(FakeHost::new("root"));
        let report = probe_for(&host, settings("root")).probe(&server()).await;
        assert_eq!(report.status(), HostStatus::Online);
        assert_eq!(report.checks().len(), 4);
        let kinds: Vec<_> = report.checks().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, CheckKind::ORDER.to_vec());
        assert!(report.checks().iter().all(|c| c.is_passed()));
    }

    #[tokio::test]
    async fn test_closed_port_with_ping_is_degraded_and_resources_skipped() {
        let host = Arc::new(FakeHost::new("root"));
        host.set_port_open(false);
        let report = probe_for(&host, settings("root")).probe(&server()).await;

        assert_eq!(report.status(), HostStatus::Degraded);
        assert!(report.check(CheckKind::Reachability).unwrap().is_passed());
        assert_eq!(report.check(CheckKind::SshPort).unwrap().status, CheckStatus::Failed);
        assert_eq!(report.check(CheckKind::SshAuth).unwrap().status, CheckStatus::Failed);
        assert_eq!(report.check(CheckKind::Resources).unwrap().status, CheckStatus::Skipped);
    }

    #[tokio::test]
    async fn test_no_ping_is_offline_but_later_checks_still_run() {
        let host = Arc::new(FakeHost::new("root"));
        host.set_pingable(false);
        let report = probe_for(&host, settings("root")).probe(&server()).await;

        assert_eq!(report.status(), HostStatus::Offline);
        // never short-circuited
        assert!(report.check(CheckKind::SshPort).unwrap().is_passed());
        assert!(report.check(CheckKind::SshAuth).unwrap().is_passed());
        assert!(report.check(CheckKind::Resources).unwrap().is_passed());
    }

    #[tokio::test]
    async fn test_rejected_key_is_degraded() {
        let host = Arc::new(FakeHost::new("root"));
        host.set_auth_ok(false);
        let report = probe_for(&host, settings("root")).probe(&server()).await;
        assert_eq!(report.status(), HostStatus::Degraded);
        assert!(report
            .check(CheckKind::SshAuth)
            .unwrap()
            .detail
            .contains("rejected"));
        assert_eq!(report.check(CheckKind::Resources).unwrap().status, CheckStatus::Skipped);
    }

    #[tokio::test]
    async fn test_threshold_breach_does_not_change_status() {
        let host = Arc::new(FakeHost::new("root"));
        let mut s = settings("root");
        s.thresholds = Some(ResourceThresholds {
            max_disk_percent: Some(10.0),
            ..Default::default()
        });
        let report = probe_for(&host, s).probe(&server()).await;
        assert_eq!(report.status(), HostStatus::Online);
        let resources = report.check(CheckKind::Resources).unwrap();
        assert_eq!(resources.status, CheckStatus::Failed);
        assert!(resources.detail.contains("disk above"));
    }

    #[tokio::test]
    async fn test_session_closed_after_probe() {
        let host = Arc::new(FakeHost::new("root"));
        probe_for(&host, settings("root")).probe(&server()).await;
        assert_eq!(host.open_sessions(), 0);
    }

    #[test]
    fn test_exceeded_thresholds() {
        let snap = ResourceSnapshot {
            cpus: 2,
            load1: 3.0,
            memory_percent: 50.0,
            disk_percent: 50.0,
        };
        let t = ResourceThresholds {
            max_load_per_cpu: Some(1.0),
            ..Default::default()
        };
        assert!(exceeded(&snap, &t).unwrap().contains("load"));
        assert!(exceeded(&snap, &ResourceThresholds::default()).is_none());
    }

    #[tokio::test]
    async fn test_system_probe_closed_port_fails() {
        // bind then drop to find a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = SystemNetworkProbe
            .tcp_connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_system_probe_open_port_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        SystemNetworkProbe
            .tcp_connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
    }
}
