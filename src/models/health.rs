//! Health report model and status reduction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four ordered checks run against every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Reachability,
    SshPort,
    SshAuth,
    Resources,
}

impl CheckKind {
    pub const ORDER: [CheckKind; 4] = [
        CheckKind::Reachability,
        CheckKind::SshPort,
        CheckKind::SshAuth,
        CheckKind::Resources,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Reachability => "reachability",
            CheckKind::SshPort => "ssh_port",
            CheckKind::SshAuth => "ssh_auth",
            CheckKind::Resources => "resources",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// Not attempted because a prerequisite check failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    pub fn passed(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: CheckStatus::Passed,
            detail: detail.into(),
        }
    }

    pub fn failed(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: CheckStatus::Failed,
            detail: detail.into(),
        }
    }

    pub fn skipped(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: CheckStatus::Skipped,
            detail: detail.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Degraded,
    Offline,
}

impl HostStatus {
    /// Reduce the first three checks to a status. Resources never count.
    pub fn reduce(reachable: bool, port_open: bool, auth_ok: bool) -> Self {
        if !reachable {
            HostStatus::Offline
        } else if port_open && auth_ok {
            HostStatus::Online
        } else {
            HostStatus::Degraded
        }
    }

    pub fn from_checks(checks: &[CheckResult]) -> Self {
        let passed = |kind: CheckKind| checks.iter().any(|c| c.kind == kind && c.is_passed());
        Self::reduce(
            passed(CheckKind::Reachability),
            passed(CheckKind::SshPort),
            passed(CheckKind::SshAuth),
        )
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Online => "online",
            HostStatus::Degraded => "degraded",
            HostStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Result of one probe run. Status is derived from the checks and cannot be set.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    server: String,
    timestamp: DateTime<Utc>,
    checks: Vec<CheckResult>,
    status: HostStatus,
}

impl HealthReport {
    pub fn new(server: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        let status = HostStatus::from_checks(&checks);
        Self {
            server: server.into(),
            timestamp: Utc::now(),
            checks,
            status,
        }
    }

    /// Report for a host whose probe task never produced results.
    pub fn unavailable(server: impl Into<String>, reason: &str) -> Self {
        let checks = CheckKind::ORDER
            .iter()
            .map(|kind| match kind {
                CheckKind::Resources => CheckResult::skipped(*kind, reason),
                _ => CheckResult::failed(*kind, reason),
            })
            .collect();
        Self::new(server, checks)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn checks(&self) -> &[CheckResult] {
        &self.checks
    }

    pub fn status(&self) -> HostStatus {
        self.status
    }

    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.kind == kind)
    }
}

/// CPU, memory and disk usage sampled over an authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpus: u32,
    pub load1: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceSnapshot {
    pub fn load_per_cpu(&self) -> f64 {
        self.load1 / f64::from(self.cpus.max(1))
    }
}

impl fmt::Display for ResourceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "load {:.2} on {} cpu(s), memory {:.1}%, disk {:.1}%",
            self.load1, self.cpus, self.memory_percent, self.disk_percent
        )
    }
}
