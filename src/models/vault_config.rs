//! Vault configuration file model (`fleet-vault.toml`).

use crate::models::policy::PolicySection;
use crate::models::provisioning::VerifyMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultFile {
    #[serde(default)]
    pub vault: VaultSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSection {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Overrides `<root>/master.key`.
    #[serde(default)]
    pub master_key_path: Option<PathBuf>,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            version: default_version(),
            master_key_path: None,
        }
    }
}

/// How the operator host reaches the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSection {
    /// Account with existing trusted-key access on managed hosts.
    #[serde(default = "default_operator")]
    pub operator_principal: String,

    /// Private key for the operator account (agent/default identity when absent).
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_host_key_checking")]
    pub strict_host_key_checking: String,

    /// Prefix privileged commands with `sudo -n` when not connected as root.
    #[serde(default = "default_true")]
    pub use_sudo: bool,

    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            operator_principal: default_operator(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            strict_host_key_checking: default_host_key_checking(),
            use_sudo: true,
            ssh_binary: default_ssh_binary(),
        }
    }
}

impl SshSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_probe_timeout")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub port_timeout_secs: u64,

    /// Resource thresholds. Informational only; never affect status.
    #[serde(default)]
    pub thresholds: Option<ResourceThresholds>,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            ping_timeout_secs: default_probe_timeout(),
            port_timeout_secs: default_probe_timeout(),
            thresholds: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceThresholds {
    #[serde(default)]
    pub max_load_per_cpu: Option<f64>,
    #[serde(default)]
    pub max_memory_percent: Option<f64>,
    #[serde(default)]
    pub max_disk_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSection {
    /// Ceiling on hosts handled at once.
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSection {
    /// Principal installed on new hosts.
    #[serde(default = "default_admin_principal")]
    pub admin_principal: String,

    /// Public key distributed to hosts.
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,

    /// Private half of `public_key_path`; used only for verification.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default = "default_reachability_attempts")]
    pub reachability_attempts: u32,

    #[serde(default = "default_step_retries")]
    pub step_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_sudoers_prefix")]
    pub sudoers_prefix: String,

    /// Per-principal verification override.
    #[serde(default)]
    pub verify: BTreeMap<String, VerifyMethod>,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            admin_principal: default_admin_principal(),
            public_key_path: None,
            private_key_path: None,
            reachability_attempts: default_reachability_attempts(),
            step_retries: default_step_retries(),
            retry_backoff_ms: default_backoff_ms(),
            sudoers_prefix: default_sudoers_prefix(),
            verify: BTreeMap::new(),
        }
    }
}

impl ProvisioningSection {
    /// Verification method for a principal. `root` cannot log in by policy
    /// on most hosts, so it falls back to a bootstrap-session check.
    pub fn verify_method(&self, principal: &str) -> VerifyMethod {
        match self.verify.get(principal) {
            Some(method) => *method,
            None if principal == "root" => VerifyMethod::BootstrapCheck,
            None => VerifyMethod::NewSession,
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_operator() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    60
}

fn default_host_key_checking() -> String {
    "accept-new".to_string()
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_concurrency() -> usize {
    8
}

fn default_admin_principal() -> String {
    "fleetadmin".to_string()
}

fn default_reachability_attempts() -> u32 {
    3
}

fn default_step_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_sudoers_prefix() -> String {
    "90-fleet-vault".to_string()
}
