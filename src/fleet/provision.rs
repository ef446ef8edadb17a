//! Idempotent provisioning of an administrative principal on one host.
//!
//! States advance strictly in order:
//! `Unreachable → KeyChecked → PrincipalEnsured → KeyInstalled → PrivilegeGranted → Verified`.
//! Every mutating step checks the host first and only applies what is
//! missing, so re-running from any state converges without duplicates.

use crate::constants;
use crate::error::{Error, Result};
use crate::fleet::commands;
use crate::fleet::probe::NetworkProbe;
use crate::fleet::ssh::{CommandOutput, Credential, RemoteShell, Session, Target};
use crate::models::provisioning::{
    Overall, ProvisionState, ProvisioningResult, StepOutcome, StepRecord, VerifyMethod,
};
use crate::models::server::ServerRecord;
use crate::models::vault_config::{ProvisioningSection, VaultFile};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Account with existing trusted access used to bootstrap.
    pub bootstrap_principal: String,
    pub bootstrap_credential: Credential,
    pub use_sudo: bool,
    /// Single `authorized_keys` line distributed to hosts.
    pub public_key: String,
    /// Private half of `public_key`, for new-session verification.
    pub verify_credential: Credential,
    pub port_timeout: Duration,
    pub command_timeout: Duration,
    pub provisioning: ProvisioningSection,
}

impl ProvisionSettings {
    /// Settings for provisioning `principals`. New-session verification
    /// needs the private half of the distributed key: falling back to the
    /// bootstrap credential would not prove the installed key works.
    pub fn from_config(
        config: &VaultFile,
        public_key: String,
        private_key: Option<PathBuf>,
        principals: &[&str],
    ) -> Result<Self> {
        let verify_credential = match private_key {
            Some(path) => Credential::PrivateKey(path),
            None => {
                let needs_key = principals.iter().find(|p| {
                    config.provisioning.verify_method(p) == VerifyMethod::NewSession
                });
                if let Some(principal) = needs_key {
                    return Err(Error::Config(format!(
                        "provisioning.private_key_path is required to verify '{}' with new-session",
                        principal
                    )));
                }
                // never used: no principal verifies with a new session
                Credential::Agent
            }
        };
        Ok(Self {
            bootstrap_principal: config.ssh.operator_principal.clone(),
            bootstrap_credential: Credential::from_identity(config.ssh.identity_file.as_deref()),
            use_sudo: config.ssh.use_sudo,
            public_key,
            verify_credential,
            port_timeout: Duration::from_secs(config.health.port_timeout_secs),
            command_timeout: config.ssh.command_timeout(),
            provisioning: config.provisioning.clone(),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.provisioning.retry_backoff_ms;
        let delay = base.saturating_mul(1u64 << attempt.min(10));
        Duration::from_millis(delay.min(constants::MAX_RETRY_BACKOFF_MS))
    }
}

/// Validate a public key line and strip surrounding whitespace.
pub fn normalize_public_key(raw: &str) -> Result<String> {
    let key = raw.trim();
    let mut parts = key.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    let known = kind.starts_with("ssh-") || kind.starts_with("ecdsa-");
    if key.contains('\n') || !known || body.is_empty() {
        return Err(Error::Config(
            "public key must be a single OpenSSH authorized_keys line".into(),
        ));
    }
    Ok(key.to_string())
}

/// Per-host run state.
struct Run<'a> {
    server: &'a ServerRecord,
    principal: &'a str,
    steps: Vec<StepRecord>,
    reached: ProvisionState,
}

impl Run<'_> {
    fn record(&mut self, outcome: StepOutcome, attempts: u32) {
        let advance = !outcome.is_failure() && !matches!(outcome, StepOutcome::Skipped(_));
        let step = self.reached.step_name().to_string();
        tracing::info!(
            host = %self.server.hostname,
            principal = self.principal,
            step = %step,
            outcome = outcome.label(),
            attempts,
            "provisioning step"
        );
        self.steps.push(StepRecord {
            step,
            outcome,
            attempts,
        });
        if advance {
            if let Some(next) = self.reached.next() {
                self.reached = next;
            }
        }
    }

    fn finish(self, overall: Overall) -> ProvisioningResult {
        ProvisioningResult {
            server: self.server.hostname.clone(),
            principal: self.principal.to_string(),
            steps: self.steps,
            reached: self.reached,
            overall,
        }
    }
}

pub struct ProvisioningEngine {
    shell: Arc<dyn RemoteShell>,
    network: Arc<dyn NetworkProbe>,
    settings: ProvisionSettings,
}

impl ProvisioningEngine {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        network: Arc<dyn NetworkProbe>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            shell,
            network,
            settings,
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Drive `server` to `Verified` for `principal`. Never returns an error:
    /// failures land in the result with the furthest state reached.
    pub async fn provision(&self, server: &ServerRecord, principal: &str) -> ProvisioningResult {
        let mut run = Run {
            server,
            principal,
            steps: Vec::new(),
            reached: ProvisionState::Unreachable,
        };

        // 1: reachable and the bootstrap credential works
        let (session, attempts) = self.reach(server).await;
        let session = match session {
            Ok(session) => {
                run.record(StepOutcome::Confirmed, attempts);
                session
            }
            Err(e) => {
                run.record(StepOutcome::Failed(e.to_string()), attempts);
                return run.finish(Overall::Failure);
            }
        };

        let overall = self.converge(&mut run, &session).await;
        self.shell.close(session).await;
        run.finish(overall)
    }

    async fn reach(&self, server: &ServerRecord) -> (Result<Session>, u32) {
        let s = &self.settings;
        let max = s.provisioning.reachability_attempts.max(1);
        let target = Target::new(
            &server.hostname,
            server.address(),
            server.ssh_port,
            &s.bootstrap_principal,
        );
        let mut last = None;
        for attempt in 0..max {
            if attempt > 0 {
                tokio::time::sleep(s.backoff(attempt - 1)).await;
            }
            let result = match self
                .network
                .tcp_connect(server.address(), server.ssh_port, s.port_timeout)
                .await
            {
                Ok(()) => self.shell.connect(&target, &s.bootstrap_credential).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(session) => return (Ok(session.with_sudo(s.use_sudo)), attempt + 1),
                Err(e) if e.is_transient() => last = Some(e),
                Err(e) => return (Err(e), attempt + 1),
            }
        }
        let err = last.unwrap_or_else(|| Error::Connect {
            host: server.hostname.clone(),
            message: "unreachable".into(),
        });
        (Err(err), max)
    }

    async fn converge(&self, run: &mut Run<'_>, session: &Session) -> Overall {
        let principal = run.principal;

        let (result, attempts) = self.retrying(|| self.ensure_principal(session, principal)).await;
        if !self.settle(run, result, attempts) {
            return Overall::Failure;
        }

        let (result, attempts) = self.retrying(|| self.install_key(session, principal)).await;
        if !self.settle(run, result, attempts) {
            return Overall::Failure;
        }

        let (result, attempts) = self.retrying(|| self.grant_privilege(session, principal)).await;
        if !self.settle(run, result, attempts) {
            return Overall::Failure;
        }

        match self.settings.provisioning.verify_method(principal) {
            VerifyMethod::Skip => {
                run.record(StepOutcome::Skipped("verification disabled for principal".into()), 0);
                Overall::Partial
            }
            method => {
                let (result, attempts) = self.retrying(|| self.verify(session, principal, method)).await;
                if self.settle(run, result, attempts) {
                    Overall::Success
                } else {
                    Overall::Failure
                }
            }
        }
    }

    /// Record a step result; false when the run must stop.
    fn settle(&self, run: &mut Run<'_>, result: Result<StepOutcome>, attempts: u32) -> bool {
        match result {
            Ok(outcome) => {
                run.record(outcome, attempts);
                true
            }
            Err(e) => {
                tracing::warn!(
                    host = %run.server.hostname,
                    step = run.reached.step_name(),
                    error = %e,
                    "provisioning stopped"
                );
                run.record(StepOutcome::Failed(e.to_string()), attempts);
                false
            }
        }
    }

    /// Retry transient failures with exponential backoff.
    async fn retrying<F, Fut>(&self, mut step: F) -> (Result<StepOutcome>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StepOutcome>>,
    {
        let retries = self.settings.provisioning.step_retries;
        let mut attempt = 0u32;
        loop {
            match step().await {
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = self.settings.backoff(attempt);
                    tracing::debug!(error = %e, attempt = attempt + 1, ?delay, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return (other, attempt + 1),
            }
        }
    }

    async fn sh(&self, session: &Session, command: &str) -> Result<CommandOutput> {
        self.shell
            .run(
                session,
                &commands::privileged(command, session.sudo()),
                self.settings.command_timeout,
            )
            .await
    }

    fn step_error(&self, session: &Session, what: &str, out: &CommandOutput) -> Error {
        Error::Provisioning {
            host: session.target().host.clone(),
            step: what.to_string(),
            message: out.summary(),
        }
    }

    async fn ensure_principal(&self, session: &Session, principal: &str) -> Result<StepOutcome> {
        if self.sh(session, &commands::principal_exists(principal)).await?.success() {
            return Ok(StepOutcome::AlreadyPresent);
        }
        let out = self.sh(session, &commands::create_principal(principal)).await?;
        if !out.success() {
            return Err(self.step_error(session, "create principal", &out));
        }
        Ok(StepOutcome::Applied)
    }

    async fn install_key(&self, session: &Session, principal: &str) -> Result<StepOutcome> {
        let key = &self.settings.public_key;
        if self.sh(session, &commands::key_present(principal, key)).await?.success() {
            return Ok(StepOutcome::AlreadyPresent);
        }
        let out = self
            .shell
            .upload_and_run(
                session,
                commands::INSTALL_KEY_SCRIPT,
                &[principal.to_string(), key.clone()],
                self.settings.command_timeout,
            )
            .await?;
        if !out.success() {
            return Err(self.step_error(session, "install key", &out));
        }
        Ok(StepOutcome::Applied)
    }

    async fn grant_privilege(&self, session: &Session, principal: &str) -> Result<StepOutcome> {
        if principal == "root" {
            return Ok(StepOutcome::AlreadyPresent);
        }
        let path = commands::sudoers_path(&self.settings.provisioning.sudoers_prefix, principal);
        let line = commands::sudoers_line(principal);
        if self.sh(session, &commands::sudoers_present(&path, &line)).await?.success() {
            return Ok(StepOutcome::AlreadyPresent);
        }
        let out = self.sh(session, &commands::install_sudoers(&path, &line)).await?;
        if !out.success() {
            return Err(self.step_error(session, "install sudoers drop-in", &out));
        }
        Ok(StepOutcome::Applied)
    }

    async fn verify(
        &self,
        bootstrap: &Session,
        principal: &str,
        method: VerifyMethod,
    ) -> Result<StepOutcome> {
        match method {
            VerifyMethod::NewSession => {
                let t = bootstrap.target();
                let target = Target::new(&t.host, &t.address, t.port, principal);
                // the installed key, never the bootstrap credential
                let session = self
                    .shell
                    .connect(&target, &self.settings.verify_credential)
                    .await?;
                let out = self
                    .shell
                    .run(
                        &session,
                        &commands::verify_privilege(principal),
                        self.settings.command_timeout,
                    )
                    .await;
                self.shell.close(session).await;
                let out = out?;
                if !out.success() {
                    return Err(self.step_error(bootstrap, "verify new session", &out));
                }
            }
            VerifyMethod::BootstrapCheck => {
                let out = self
                    .sh(
                        bootstrap,
                        &commands::bootstrap_check(principal, &self.settings.public_key),
                    )
                    .await?;
                if !out.success() {
                    return Err(self.step_error(bootstrap, "verify over bootstrap session", &out));
                }
            }
            VerifyMethod::Skip => return Ok(StepOutcome::Skipped("verification disabled".into())),
        }
        Ok(StepOutcome::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::{FakeHost, TEST_KEY};
    use std::collections::BTreeMap;

    fn settings(bootstrap: &str) -> ProvisionSettings {
        ProvisionSettings {
            bootstrap_principal: bootstrap.to_string(),
            bootstrap_credential: Credential::Agent,
            use_sudo: true,
            public_key: TEST_KEY.to_string(),
            verify_credential: Credential::PrivateKey("/keys/fleet".into()),
            port_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(5),
            provisioning: ProvisioningSection {
                retry_backoff_ms: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut s = settings("ops");
        s.provisioning.retry_backoff_ms = 500;
        assert_eq!(s.backoff(0), Duration::from_millis(500));
        assert_eq!(s.backoff(3), Duration::from_millis(4000));
        let cap = Duration::from_millis(constants::MAX_RETRY_BACKOFF_MS);
        assert_eq!(s.backoff(7), cap);
        s.provisioning.retry_backoff_ms = u64::MAX;
        assert_eq!(s.backoff(1), cap);
    }

    #[test]
    fn test_new_session_requires_private_key() {
        let mut config = VaultFile::default();
        let err = ProvisionSettings::from_config(&config, TEST_KEY.into(), None, &["fleetadmin"])
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("fleetadmin")));

        let ok = ProvisionSettings::from_config(
            &config,
            TEST_KEY.into(),
            Some("/keys/fleet".into()),
            &["fleetadmin"],
        )
        .unwrap();
        assert!(matches!(ok.verify_credential, Credential::PrivateKey(_)));

        // root and explicit overrides never open a new session
        config
            .provisioning
            .verify
            .insert("backup".into(), VerifyMethod::Skip);
        assert!(
            ProvisionSettings::from_config(&config, TEST_KEY.into(), None, &["root", "backup"])
                .is_ok()
        );
    }

    fn engine(host: &Arc<FakeHost>, settings: ProvisionSettings) -> ProvisioningEngine {
        ProvisioningEngine::new(host.clone(), host.clone(), settings)
    }

    fn server() -> ServerRecord {
        ServerRecord::new("web01", "10.0.0.1", 22, "fleetadmin")
    }

    fn outcomes(result: &ProvisioningResult) -> Vec<(&str, &str)> {
        result
            .steps
            .iter()
            .map(|s| (s.step.as_str(), s.outcome.label()))
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_host_reaches_verified() {
        let host = Arc::new(FakeHost::new("ops"));
        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;

        assert_eq!(result.overall, Overall::Success);
        assert_eq!(result.reached, ProvisionState::Verified);
        assert!(result.changed());
        assert_eq!(
            outcomes(&result),
            vec![
                ("reachability", "confirmed"),
                ("ensure_principal", "applied"),
                ("install_key", "applied"),
                ("grant_privilege", "applied"),
                ("verify", "confirmed"),
            ]
        );
        assert_eq!(host.key_count("fleetadmin", TEST_KEY), 1);
        assert!(host.has_sudoers("/etc/sudoers.d/90-fleet-vault-fleetadmin"));
        assert!(host.user_locked("fleetadmin"));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let host = Arc::new(FakeHost::new("ops"));
        let engine = engine(&host, settings("ops"));
        let first = engine.provision(&server(), "fleetadmin").await;
        let second = engine.provision(&server(), "fleetadmin").await;

        assert_eq!(first.reached, ProvisionState::Verified);
        assert_eq!(second.reached, ProvisionState::Verified);
        assert_eq!(second.overall, Overall::Success);
        assert!(!second.changed());
        assert_eq!(host.key_count("fleetadmin", TEST_KEY), 1);
        assert_eq!(host.sudoers_writes(), 1);
    }

    #[tokio::test]
    async fn test_partial_state_converges() {
        let host = Arc::new(FakeHost::new("ops"));
        host.add_user("fleetadmin");
        host.add_key("fleetadmin", TEST_KEY);

        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;
        assert_eq!(result.overall, Overall::Success);
        assert_eq!(
            outcomes(&result)[1..4],
            [
                ("ensure_principal", "already-present"),
                ("install_key", "already-present"),
                ("grant_privilege", "applied"),
            ]
        );
        assert_eq!(host.key_count("fleetadmin", TEST_KEY), 1);
    }

    #[tokio::test]
    async fn test_unreachable_never_passes_step_one() {
        let host = Arc::new(FakeHost::new("ops"));
        host.set_port_open(false);
        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;

        assert_eq!(result.overall, Overall::Failure);
        assert_eq!(result.reached, ProvisionState::Unreachable);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].attempts, 3);
        assert!(!result.changed());
        assert_eq!(host.commands_run(), 0);
    }

    #[tokio::test]
    async fn test_auth_rejection_not_retried() {
        let host = Arc::new(FakeHost::new("ops"));
        host.set_auth_ok(false);
        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;
        assert_eq!(result.overall, Overall::Failure);
        assert_eq!(result.steps[0].attempts, 1);
        assert!(result.failed_step().unwrap().outcome.detail().unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let host = Arc::new(FakeHost::new("ops"));
        host.fail_next_runs(2);
        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;
        assert_eq!(result.overall, Overall::Success);
        assert_eq!(result.steps[1].attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_records_furthest_state() {
        let host = Arc::new(FakeHost::new("ops"));
        host.fail_next_runs(100);
        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;
        assert_eq!(result.overall, Overall::Failure);
        assert_eq!(result.reached, ProvisionState::KeyChecked);
        let failed = result.failed_step().unwrap();
        assert_eq!(failed.step, "ensure_principal");
        assert_eq!(failed.attempts, 3);
        assert!(failed.outcome.detail().unwrap().contains("connection reset by peer"));
        assert!(!result.changed());
    }

    #[tokio::test]
    async fn test_failed_step_leaves_earlier_steps_in_place() {
        let host = Arc::new(FakeHost::new("ops"));
        host.set_visudo_ok(false);
        let engine = engine(&host, settings("ops"));
        let result = engine.provision(&server(), "fleetadmin").await;

        assert_eq!(result.overall, Overall::Failure);
        assert_eq!(result.reached, ProvisionState::KeyInstalled);
        assert!(result.changed());
        assert_eq!(host.key_count("fleetadmin", TEST_KEY), 1);

        host.set_visudo_ok(true);
        let rerun = engine.provision(&server(), "fleetadmin").await;
        assert_eq!(rerun.overall, Overall::Success);
        assert_eq!(rerun.steps[2].outcome, StepOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_skip_verification_is_partial() {
        let host = Arc::new(FakeHost::new("ops"));
        let mut s = settings("ops");
        s.provisioning.verify = BTreeMap::from([("fleetadmin".to_string(), VerifyMethod::Skip)]);
        let result = engine(&host, s).provision(&server(), "fleetadmin").await;
        assert_eq!(result.overall, Overall::Partial);
        assert_eq!(result.reached, ProvisionState::PrivilegeGranted);
        assert_eq!(result.steps.last().unwrap().outcome.label(), "skipped");
    }

    #[tokio::test]
    async fn test_root_uses_bootstrap_check() {
        let host = Arc::new(FakeHost::new("root"));
        let result = engine(&host, settings("root")).provision(&server(), "root").await;
        assert_eq!(result.overall, Overall::Success);
        assert_eq!(result.steps[3].outcome, StepOutcome::AlreadyPresent);
        assert_eq!(host.key_count("root", TEST_KEY), 1);
        // no login as root with the new key
        assert_eq!(host.connects_as("root"), 1);
        assert_eq!(host.sudo_commands(), 0);
    }

    #[tokio::test]
    async fn test_new_session_uses_installed_key() {
        let host = Arc::new(FakeHost::new("ops"));
        engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;
        assert_eq!(
            host.last_credential_for("fleetadmin"),
            Some(Credential::PrivateKey("/keys/fleet".into()))
        );
    }

    #[tokio::test]
    async fn test_remote_script_always_removed() {
        let host = Arc::new(FakeHost::new("ops"));
        host.set_script_fails(true);
        let result = engine(&host, settings("ops")).provision(&server(), "fleetadmin").await;
        assert_eq!(result.failed_step().unwrap().step, "install_key");
        assert_eq!(host.leftover_scripts(), 0);
    }

    #[test]
    fn test_normalize_public_key() {
        assert_eq!(
            normalize_public_key("  ssh-ed25519 AAAA ops@host\n").unwrap(),
            "ssh-ed25519 AAAA ops@host"
        );
        assert!(normalize_public_key("not a key").is_err());
        assert!(normalize_public_key("ssh-ed25519").is_err());
    }
}
