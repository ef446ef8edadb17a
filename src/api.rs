//! Operator-facing operations with authorization and audit.
//!
//! `FleetManager` is the only entry point callers outside the crate need.
//! Each operation checks the caller-supplied `AuthContext`, runs, and
//! appends one audit event with the outcome. Nothing below this layer
//! knows who the caller is.

use crate::core::audit_log::{self, AuditEntry, AuditEvent};
use crate::core::codec::MasterKey;
use crate::core::config;
use crate::core::paths::VaultPaths;
use crate::core::registry::Registry;
use crate::core::vault_store::{self, VaultStore};
use crate::error::{Error, Result};
use crate::fleet::commands;
use crate::fleet::coordinator::{BatchOutcome, FleetCoordinator};
use crate::fleet::probe::{HealthProbe, NetworkProbe, ProbeSettings, SystemNetworkProbe};
use crate::fleet::provision::{self, ProvisionSettings, ProvisioningEngine};
use crate::fleet::ssh::{Credential, RemoteShell, Session, SshExecutor, Target};
use crate::models::health::{HealthReport, HostStatus};
use crate::models::provisioning::{Overall, ProvisioningResult};
use crate::models::secret::{CurrentSecret, VersionMeta};
use crate::models::server::ServerRecord;
use crate::models::vault_config::VaultFile;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Permission an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    SecretsRead,
    SecretsWrite,
    FleetRead,
    FleetWrite,
    AuditRead,
}

/// The caller's authorization decision, made outside the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Scoped(BTreeSet<Scope>),
    Deny,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub actor: String,
    pub decision: Decision,
}

impl AuthContext {
    pub fn new(actor: impl Into<String>, decision: Decision) -> Self {
        Self {
            actor: actor.into(),
            decision,
        }
    }

    /// The local operator running the CLI. Always allowed.
    pub fn local_operator() -> Self {
        Self::new(audit_log::detect_actor(), Decision::Allow)
    }

    pub fn allows(&self, scope: Scope) -> bool {
        match &self.decision {
            Decision::Allow => true,
            Decision::Scoped(scopes) => scopes.contains(&scope),
            Decision::Deny => false,
        }
    }
}

pub struct FleetManager {
    config: VaultFile,
    store: VaultStore,
    shell: Arc<dyn RemoteShell>,
    network: Arc<dyn NetworkProbe>,
    coordinator: FleetCoordinator,
}

impl FleetManager {
    /// Open against the real fleet. A missing or unusable master key is fatal.
    pub fn open(paths: VaultPaths) -> Result<Self> {
        let config = config::load(&paths.config)?;
        let key = MasterKey::load(&config::master_key_path(&paths, &config))?;
        let shell = Arc::new(SshExecutor::new(&config.ssh));
        Self::with_remote(paths, config, &key, shell, Arc::new(SystemNetworkProbe))
    }

    pub fn with_remote(
        paths: VaultPaths,
        config: VaultFile,
        key: &MasterKey,
        shell: Arc<dyn RemoteShell>,
        network: Arc<dyn NetworkProbe>,
    ) -> Result<Self> {
        config::validate(&config)?;
        let coordinator = FleetCoordinator::new(config.fleet.max_concurrency);
        Ok(Self {
            store: VaultStore::open(paths, key)?,
            config,
            shell,
            network,
            coordinator,
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        self.store.paths()
    }

    pub fn config(&self) -> &VaultFile {
        &self.config
    }

    /// Cancels the running fleet batch: no new hosts start.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.coordinator.cancellation_token()
    }

    fn registry(&self) -> Registry<'_> {
        Registry::new(self.store.paths())
    }

    fn audit<T>(&self, event: AuditEvent, result: &Result<T>) {
        let action = event.action.clone();
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = audit_log::record(
            self.store.paths(),
            event,
            outcome,
            self.config.policy.journald_audit,
        ) {
            tracing::warn!(action = %action, error = %e, "audit log write failed");
        }
    }

    /// Fail with `Unauthorized` (and audit the refusal) unless `scope` is granted.
    fn authorize(&self, auth: &AuthContext, scope: Scope, event: &AuditEvent) -> Result<()> {
        if auth.allows(scope) {
            return Ok(());
        }
        let denied: Result<()> = Err(Error::Unauthorized {
            actor: auth.actor.clone(),
            action: event.action.clone(),
        });
        tracing::warn!(actor = %auth.actor, action = %event.action, "operation denied");
        self.audit(event.clone(), &denied);
        denied
    }

    /// Authorize, run a synchronous operation, audit the outcome.
    fn guarded<T>(
        &self,
        auth: &AuthContext,
        scope: Scope,
        event: AuditEvent,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.authorize(auth, scope, &event)?;
        let result = op();
        self.audit(event, &result);
        result
    }

    fn length_or_default(&self, length: Option<usize>) -> usize {
        length.unwrap_or(self.config.policy.default_length)
    }

    // ---- vault ----

    /// Generate and store a new secret. The plaintext is returned once.
    pub fn create_secret(
        &self,
        auth: &AuthContext,
        server: &str,
        principal: &str,
        length: Option<usize>,
    ) -> Result<(VersionMeta, Zeroizing<String>)> {
        let length = self.length_or_default(length);
        let event = AuditEvent::new("create-secret", &auth.actor)
            .server(server)
            .principal(principal)
            .detail(format!("length={}", length));
        self.guarded(auth, Scope::SecretsWrite, event, || {
            let (entry, secret) =
                self.store
                    .create_secret(server, principal, length, &self.config.policy)?;
            Ok((entry.meta(true), secret))
        })
    }

    pub fn rotate_secret(
        &self,
        auth: &AuthContext,
        server: &str,
        principal: &str,
        length: Option<usize>,
    ) -> Result<(VersionMeta, Zeroizing<String>)> {
        let length = self.length_or_default(length);
        let event = AuditEvent::new("rotate-secret", &auth.actor)
            .server(server)
            .principal(principal)
            .detail(format!("length={}", length));
        self.guarded(auth, Scope::SecretsWrite, event, || {
            let (entry, secret) = self
                .store
                .rotate(server, principal, length, &self.config.policy)?;
            Ok((entry.meta(true), secret))
        })
    }

    /// Rotate to a caller-supplied value.
    pub fn store_secret(
        &self,
        auth: &AuthContext,
        server: &str,
        principal: &str,
        plaintext: &[u8],
    ) -> Result<VersionMeta> {
        let event = AuditEvent::new("rotate-secret", &auth.actor)
            .server(server)
            .principal(principal)
            .detail("source=stdin");
        self.guarded(auth, Scope::SecretsWrite, event, || {
            Ok(self.store.store_secret(server, principal, plaintext)?.meta(true))
        })
    }

    pub fn retrieve_secret(
        &self,
        auth: &AuthContext,
        server: &str,
        principal: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let event = AuditEvent::new("retrieve-secret", &auth.actor)
            .server(server)
            .principal(principal);
        self.guarded(auth, Scope::SecretsRead, event, || {
            self.store.get_current(server, principal)
        })
    }

    pub fn list_secrets(&self, auth: &AuthContext) -> Result<Vec<CurrentSecret>> {
        let event = AuditEvent::new("list-secrets", &auth.actor);
        self.guarded(auth, Scope::SecretsRead, event, || self.store.list_current())
    }

    /// Version history of one pair, or of every principal on `server`.
    pub fn show_history(
        &self,
        auth: &AuthContext,
        server: &str,
        principal: Option<&str>,
    ) -> Result<Vec<VersionMeta>> {
        let mut event = AuditEvent::new("show-history", &auth.actor).server(server);
        if let Some(p) = principal {
            event = event.principal(p);
        }
        self.guarded(auth, Scope::SecretsRead, event, || match principal {
            Some(p) => self.store.list_history(server, p),
            None => self.store.list_server_history(server),
        })
    }

    // ---- registry ----

    pub fn add_server(&self, auth: &AuthContext, record: ServerRecord) -> Result<ServerRecord> {
        let event = AuditEvent::new("server-add", &auth.actor)
            .server(&record.hostname)
            .principal(&record.admin_principal)
            .detail(format!("{}:{}", record.address(), record.ssh_port));
        self.guarded(auth, Scope::FleetWrite, event, || self.registry().add(record))
    }

    /// Remove a server and orphan its live pointers. Entries stay for audit.
    pub fn remove_server(
        &self,
        auth: &AuthContext,
        hostname: &str,
    ) -> Result<(ServerRecord, Vec<String>)> {
        let event = AuditEvent::new("server-remove", &auth.actor).server(hostname);
        self.guarded(auth, Scope::FleetWrite, event, || {
            let removed = self.registry().remove(hostname)?;
            let orphaned = self.store.orphan_server(hostname)?;
            Ok((removed, orphaned))
        })
    }

    pub fn list_servers(&self, auth: &AuthContext) -> Result<Vec<ServerRecord>> {
        let event = AuditEvent::new("server-list", &auth.actor);
        self.guarded(auth, Scope::FleetRead, event, || self.registry().list())
    }

    // ---- remote ----

    async fn operator_session(&self, server: &ServerRecord) -> Result<Session> {
        let ssh = &self.config.ssh;
        let target = Target::new(
            &server.hostname,
            server.address(),
            server.ssh_port,
            &ssh.operator_principal,
        );
        let credential = Credential::from_identity(ssh.identity_file.as_deref());
        let session = self.shell.connect(&target, &credential).await?;
        Ok(session.with_sudo(ssh.use_sudo))
    }

    /// Whether `principal` exists on the host.
    pub async fn validate_user(
        &self,
        auth: &AuthContext,
        hostname: &str,
        principal: &str,
    ) -> Result<bool> {
        let event = AuditEvent::new("validate-user", &auth.actor)
            .server(hostname)
            .principal(principal);
        self.authorize(auth, Scope::FleetRead, &event)?;
        let result: Result<bool> = async {
            vault_store::validate_principal(principal)?;
            let server = self.registry().get(hostname)?;
            let session = self.operator_session(&server).await?;
            let out = self
                .shell
                .run(
                    &session,
                    &commands::principal_exists(principal),
                    self.config.ssh.command_timeout(),
                )
                .await;
            self.shell.close(session).await;
            Ok(out?.success())
        }
        .await;
        let event = match &result {
            Ok(exists) => event.detail(format!("exists={}", exists)),
            Err(_) => event,
        };
        self.audit(event, &result);
        result
    }

    /// Set the principal's password on the host to the current vault secret.
    /// The secret travels on stdin, never on a command line.
    pub async fn deploy_secret(
        &self,
        auth: &AuthContext,
        hostname: &str,
        principal: &str,
    ) -> Result<VersionMeta> {
        let event = AuditEvent::new("deploy-secret", &auth.actor)
            .server(hostname)
            .principal(principal);
        self.authorize(auth, Scope::FleetWrite, &event)?;
        let result: Result<VersionMeta> = async {
            vault_store::validate_principal(principal)?;
            let server = self.registry().get(hostname)?;
            let version_id = self
                .store
                .current_version(hostname, principal)?
                .ok_or_else(|| Error::NotFound {
                    server: hostname.to_string(),
                    principal: principal.to_string(),
                })?;
            let secret = self.store.decrypt_version(hostname, principal, &version_id)?;
            if secret.contains(&b'\n') {
                return Err(Error::Policy(
                    "secret contains a newline and cannot be set with chpasswd".into(),
                ));
            }
            let mut line = Zeroizing::new(Vec::with_capacity(principal.len() + secret.len() + 2));
            line.extend_from_slice(principal.as_bytes());
            line.push(b':');
            line.extend_from_slice(&secret);
            line.push(b'\n');

            let session = self.operator_session(&server).await?;
            let out = self
                .shell
                .run_with_input(
                    &session,
                    &commands::privileged(commands::CHPASSWD, session.sudo()),
                    &line,
                    self.config.ssh.command_timeout(),
                )
                .await;
            self.shell.close(session).await;
            let out = out?;
            if !out.success() {
                return Err(Error::Provisioning {
                    host: hostname.to_string(),
                    step: "deploy_secret".into(),
                    message: out.summary(),
                });
            }
            let created_at = self
                .store
                .list_history(hostname, principal)?
                .into_iter()
                .find(|m| m.version_id == version_id)
                .map(|m| m.created_at)
                .unwrap_or_else(chrono::Utc::now);
            Ok(VersionMeta {
                server: hostname.to_string(),
                principal: principal.to_string(),
                version_id,
                created_at,
                current: true,
            })
        }
        .await;
        let event = match &result {
            Ok(meta) => event.detail(format!("version={}", meta.version_id)),
            Err(_) => event,
        };
        self.audit(event, &result);
        result
    }

    fn health_probe(&self) -> Arc<HealthProbe> {
        Arc::new(HealthProbe::new(
            self.shell.clone(),
            self.network.clone(),
            ProbeSettings::from_config(&self.config),
        ))
    }

    /// Probe `hosts` (all registered when empty). With `targeted` and no
    /// explicit hosts, only hosts not last seen online are probed.
    /// Results are stored in the registry.
    pub async fn health(
        &self,
        auth: &AuthContext,
        hosts: &[String],
        targeted: bool,
    ) -> Result<BatchOutcome<HealthReport>> {
        let event = AuditEvent::new("health", &auth.actor);
        self.authorize(auth, Scope::FleetRead, &event)?;
        let result: Result<BatchOutcome<HealthReport>> = async {
            let servers = self.registry().select(hosts)?;
            let probe = self.health_probe();
            let outcome = if targeted && hosts.is_empty() {
                self.coordinator.health_check_targeted(&probe, servers).await
            } else {
                self.coordinator.health_check_all(&probe, servers).await
            };
            self.registry().record_health(outcome.results.values())?;
            Ok(outcome)
        }
        .await;
        let event = match &result {
            Ok(outcome) => event.detail(summarize_health(outcome)),
            Err(_) => event,
        };
        self.audit(event, &result);
        result
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths().root.join(path)
        }
    }

    fn public_key(&self) -> Result<String> {
        let path = self.config.provisioning.public_key_path.as_ref().ok_or_else(|| {
            Error::Config("provisioning.public_key_path is not set".into())
        })?;
        let path = self.resolve(path);
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::io_context(e, format!("read public key {}", path.display())))?;
        provision::normalize_public_key(&raw)
    }

    fn engine(&self, principals: &[&str]) -> Result<ProvisioningEngine> {
        let private_key = self
            .config
            .provisioning
            .private_key_path
            .as_deref()
            .map(|p| self.resolve(p));
        let settings = ProvisionSettings::from_config(
            &self.config,
            self.public_key()?,
            private_key,
            principals,
        )?;
        Ok(ProvisioningEngine::new(
            self.shell.clone(),
            self.network.clone(),
            settings,
        ))
    }

    fn audit_provisioning(&self, auth: &AuthContext, result: &ProvisioningResult) {
        let event = AuditEvent::new("provision", &auth.actor)
            .server(&result.server)
            .principal(&result.principal)
            .detail(format!(
                "overall={} reached={} changed={}",
                result.overall,
                result.reached,
                result.changed()
            ));
        let outcome: Result<()> = match result.failed_step() {
            Some(step) if result.overall == Overall::Failure => Err(Error::Provisioning {
                host: result.server.clone(),
                step: step.step.clone(),
                message: step.outcome.detail().unwrap_or_default().to_string(),
            }),
            _ => Ok(()),
        };
        self.audit(event, &outcome);
    }

    /// Provision one registered host, for `principal` or its registered admin.
    pub async fn provision_host(
        &self,
        auth: &AuthContext,
        hostname: &str,
        principal: Option<&str>,
    ) -> Result<ProvisioningResult> {
        let event = AuditEvent::new("provision", &auth.actor).server(hostname);
        self.authorize(auth, Scope::FleetWrite, &event)?;
        let prepared = self.registry().get(hostname).and_then(|server| {
            let principal = principal.unwrap_or(&server.admin_principal).to_string();
            vault_store::validate_principal(&principal)?;
            let engine = self.engine(&[principal.as_str()])?;
            Ok((server, principal, engine))
        });
        let (server, principal, engine) = match prepared {
            Ok(p) => p,
            Err(e) => {
                let failed: Result<ProvisioningResult> = Err(e);
                self.audit(event, &failed);
                return failed;
            }
        };
        let result = self
            .coordinator
            .provision_host(&engine, &server, &principal)
            .await;
        self.audit_provisioning(auth, &result);
        Ok(result)
    }

    /// Provision `hosts` (all registered when empty) for their admin principals.
    pub async fn provision(
        &self,
        auth: &AuthContext,
        hosts: &[String],
    ) -> Result<BatchOutcome<ProvisioningResult>> {
        let event = AuditEvent::new("provision", &auth.actor);
        self.authorize(auth, Scope::FleetWrite, &event)?;
        let prepared = self
            .registry()
            .select(hosts)
            .and_then(|servers| {
                let engine = {
                    let principals: Vec<&str> =
                        servers.iter().map(|s| s.admin_principal.as_str()).collect();
                    Arc::new(self.engine(&principals)?)
                };
                Ok((servers, engine))
            });
        let (servers, engine) = match prepared {
            Ok(p) => p,
            Err(e) => {
                let failed: Result<BatchOutcome<ProvisioningResult>> = Err(e);
                self.audit(event, &failed);
                return failed;
            }
        };
        let outcome = self.coordinator.provision_many(&engine, servers).await;
        for result in outcome.results.values() {
            self.audit_provisioning(auth, result);
        }
        Ok(outcome)
    }

    // ---- audit ----

    pub fn audit_entries(&self, auth: &AuthContext, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let event = AuditEvent::new("audit-log", &auth.actor);
        self.authorize(auth, Scope::AuditRead, &event)?;
        audit_log::read_log(self.paths(), limit)
    }

    /// Verify the hash chain. Returns the line count and any breaks found.
    pub fn verify_audit(&self, auth: &AuthContext) -> Result<(usize, Vec<String>)> {
        let event = AuditEvent::new("audit-verify", &auth.actor);
        self.guarded(auth, Scope::AuditRead, event, || audit_log::verify_chain(self.paths()))
    }
}

fn summarize_health(outcome: &BatchOutcome<HealthReport>) -> String {
    let count = |status: HostStatus| {
        outcome
            .results
            .values()
            .filter(|r| r.status() == status)
            .count()
    };
    format!(
        "online={} degraded={} offline={} not_started={}",
        count(HostStatus::Online),
        count(HostStatus::Degraded),
        count(HostStatus::Offline),
        outcome.not_started.len()
    )
}
