//! Remote side: SSH execution, health probes, provisioning, fan-out.
//!
//! Everything here is async. Per-host work owns its own `Session`;
//! nothing is shared between host tasks except the coordinator's semaphore.

pub mod commands;
pub mod coordinator;
pub mod probe;
pub mod provision;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;
