//! Managed server registry model (`servers.toml`).

use crate::models::health::HostStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub hostname: String,
    pub ip: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub admin_principal: String,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<HostStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub fn new(hostname: &str, ip: &str, ssh_port: u16, admin_principal: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            ssh_port,
            admin_principal: admin_principal.to_string(),
            added_at: Utc::now(),
            last_status: None,
            last_checked: None,
        }
    }

    /// Address used for network probes and SSH.
    pub fn address(&self) -> &str {
        if self.ip.is_empty() {
            &self.hostname
        } else {
            &self.ip
        }
    }

    /// Hosts never checked, or last seen other than online.
    pub fn needs_recheck(&self) -> bool {
        !matches!(self.last_status, Some(HostStatus::Online))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

pub fn default_ssh_port() -> u16 {
    22
}
