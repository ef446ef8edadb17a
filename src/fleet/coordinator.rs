//! Fan-out of probes and provisioning runs across the fleet.

use crate::fleet::probe::HealthProbe;
use crate::fleet::provision::ProvisioningEngine;
use crate::models::health::HealthReport;
use crate::models::provisioning::ProvisioningResult;
use crate::models::server::ServerRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Per-host results of one batch. Hosts skipped after cancellation are
/// listed in `not_started`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome<T> {
    pub results: BTreeMap<String, T>,
    pub not_started: Vec<String>,
}

impl<T> BatchOutcome<T> {
    pub fn is_complete(&self) -> bool {
        self.not_started.is_empty()
    }
}

pub struct FleetCoordinator {
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl FleetCoordinator {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            limit: Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling stops new host tasks; running ones finish or time out.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn health_check_all(
        &self,
        probe: &Arc<HealthProbe>,
        servers: Vec<ServerRecord>,
    ) -> BatchOutcome<HealthReport> {
        let probe = probe.clone();
        self.fan_out(
            servers,
            move |server| {
                let probe = probe.clone();
                async move { probe.probe(&server).await }
            },
            |server, reason| HealthReport::unavailable(server.hostname.clone(), reason),
        )
        .await
    }

    /// Re-check only hosts never checked or last seen other than online.
    pub async fn health_check_targeted(
        &self,
        probe: &Arc<HealthProbe>,
        servers: Vec<ServerRecord>,
    ) -> BatchOutcome<HealthReport> {
        let targets: Vec<ServerRecord> = servers.into_iter().filter(|s| s.needs_recheck()).collect();
        self.health_check_all(probe, targets).await
    }

    /// Provision one host for `principal`, holding a slot like any batch task.
    pub async fn provision_host(
        &self,
        engine: &ProvisioningEngine,
        server: &ServerRecord,
        principal: &str,
    ) -> ProvisioningResult {
        let _permit = match self.limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ProvisioningResult::aborted(&server.hostname, principal, "coordinator closed")
            }
        };
        engine.provision(server, principal).await
    }

    /// Provision each host for its registered admin principal.
    pub async fn provision_many(
        &self,
        engine: &Arc<ProvisioningEngine>,
        servers: Vec<ServerRecord>,
    ) -> BatchOutcome<ProvisioningResult> {
        let engine = engine.clone();
        self.fan_out(
            servers,
            move |server| {
                let engine = engine.clone();
                async move { engine.provision(&server, &server.admin_principal).await }
            },
            |server, reason| {
                ProvisioningResult::aborted(&server.hostname, &server.admin_principal, reason)
            },
        )
        .await
    }

    async fn fan_out<T, F, Fut>(
        &self,
        servers: Vec<ServerRecord>,
        task: F,
        on_abort: impl Fn(&ServerRecord, &str) -> T,
    ) -> BatchOutcome<T>
    where
        T: Send + 'static,
        F: Fn(ServerRecord) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = servers.len();
        let mut handles = Vec::with_capacity(total);
        let mut not_started = Vec::new();
        let mut pending = servers.into_iter();

        for server in pending.by_ref() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    not_started.push(server.hostname);
                    break;
                }
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        not_started.push(server.hostname);
                        break;
                    }
                },
            };
            let fut = task(server.clone());
            let handle = tokio::spawn(async move {
                let _permit = permit;
                fut.await
            });
            handles.push((server, handle));
        }
        not_started.extend(pending.map(|s| s.hostname));

        let mut results = BTreeMap::new();
        for (server, handle) in handles {
            let value = match handle.await {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(host = %server.hostname, error = %e, "host task aborted");
                    on_abort(&server, &format!("task aborted: {}", e))
                }
            };
            results.insert(server.hostname, value);
        }

        if !not_started.is_empty() {
            tracing::warn!(
                started = results.len(),
                skipped = not_started.len(),
                "batch cancelled before all hosts started"
            );
        }
        tracing::info!(hosts = total, finished = results.len(), "batch finished");
        BatchOutcome {
            results,
            not_started,
        }
    }
}
