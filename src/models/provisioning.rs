//! Provisioning state machine types and results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-host provisioning state. Each variant is the state reached after
/// the corresponding step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Unreachable,
    KeyChecked,
    PrincipalEnsured,
    KeyInstalled,
    PrivilegeGranted,
    Verified,
}

impl ProvisionState {
    /// The state following this one, `None` once verified.
    pub fn next(&self) -> Option<ProvisionState> {
        match self {
            ProvisionState::Unreachable => Some(ProvisionState::KeyChecked),
            ProvisionState::KeyChecked => Some(ProvisionState::PrincipalEnsured),
            ProvisionState::PrincipalEnsured => Some(ProvisionState::KeyInstalled),
            ProvisionState::KeyInstalled => Some(ProvisionState::PrivilegeGranted),
            ProvisionState::PrivilegeGranted => Some(ProvisionState::Verified),
            ProvisionState::Verified => None,
        }
    }

    /// Name of the step that moves a host out of this state.
    pub fn step_name(&self) -> &'static str {
        match self {
            ProvisionState::Unreachable => "reachability",
            ProvisionState::KeyChecked => "ensure_principal",
            ProvisionState::PrincipalEnsured => "install_key",
            ProvisionState::KeyInstalled => "grant_privilege",
            ProvisionState::PrivilegeGranted => "verify",
            ProvisionState::Verified => "done",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionState::Unreachable => "unreachable",
            ProvisionState::KeyChecked => "key_checked",
            ProvisionState::PrincipalEnsured => "principal_ensured",
            ProvisionState::KeyInstalled => "key_installed",
            ProvisionState::PrivilegeGranted => "privilege_granted",
            ProvisionState::Verified => "verified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum StepOutcome {
    /// The step changed the host.
    Applied,
    /// Nothing to do; the host already satisfied the step.
    AlreadyPresent,
    /// Check-only step passed.
    Confirmed,
    /// Not attempted, by policy.
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn label(&self) -> &str {
        match self {
            StepOutcome::Applied => "applied",
            StepOutcome::AlreadyPresent => "already-present",
            StepOutcome::Confirmed => "confirmed",
            StepOutcome::Skipped(_) => "skipped",
            StepOutcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            StepOutcome::Skipped(d) | StepOutcome::Failed(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overall {
    Success,
    /// Every mutating step completed but verification was skipped by policy.
    Partial,
    Failure,
}

impl fmt::Display for Overall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Overall::Success => "success",
            Overall::Partial => "partial",
            Overall::Failure => "failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub server: String,
    pub principal: String,
    pub steps: Vec<StepRecord>,
    /// Furthest state reached.
    pub reached: ProvisionState,
    pub overall: Overall,
}

impl ProvisioningResult {
    /// Result for a run whose task died before reporting. Host state is
    /// unknown; inspect it before retrying.
    pub fn aborted(server: &str, principal: &str, reason: &str) -> Self {
        Self {
            server: server.to_string(),
            principal: principal.to_string(),
            steps: vec![StepRecord {
                step: "aborted".into(),
                outcome: StepOutcome::Failed(reason.to_string()),
                attempts: 0,
            }],
            reached: ProvisionState::Unreachable,
            overall: Overall::Failure,
        }
    }

    /// Whether any step modified the host. `false` on failure means it is
    /// safe to retry without inspecting the host.
    pub fn changed(&self) -> bool {
        self.steps.iter().any(|s| s.outcome == StepOutcome::Applied)
    }

    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.outcome.is_failure())
    }
}

/// How the end of the chain is confirmed for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMethod {
    /// Log in as the principal with the installed key and run a privileged no-op.
    NewSession,
    /// Inspect key and sudoers over the bootstrap session.
    BootstrapCheck,
    Skip,
}
