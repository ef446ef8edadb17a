//! Optional journald copy of audit entries via `systemd-cat`.
//!
//! Best effort: a missing or failing `systemd-cat` never fails the operation
//! being audited.

use crate::constants;
use crate::core::audit_log::AuditEntry;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

fn systemd_cat_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new("systemd-cat")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// One-line journal form: `action actor=.. server=.. principal=.. ok|failed: ..`.
pub fn summary_line(entry: &AuditEntry) -> String {
    let mut line = format!("{} actor={}", entry.action, entry.actor);
    if let Some(server) = &entry.server {
        line.push_str(&format!(" server={}", server));
    }
    if let Some(principal) = &entry.principal {
        line.push_str(&format!(" principal={}", principal));
    }
    if let Some(detail) = &entry.detail {
        line.push_str(&format!(" [{}]", detail));
    }
    match (&entry.result.success, &entry.result.error) {
        (true, _) => line.push_str(" ok"),
        (false, Some(e)) => line.push_str(&format!(" failed: {}", e)),
        (false, None) => line.push_str(" failed"),
    }
    line
}

pub fn forward_entry(entry: &AuditEntry) {
    if !systemd_cat_available() {
        return;
    }
    let priority = if entry.result.success { "info" } else { "warning" };

    let mut child = match Command::new("systemd-cat")
        .args(["-t", constants::JOURNALD_TAG, "-p", priority])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "systemd-cat spawn failed");
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = writeln!(stdin, "{}", summary_line(entry));
    }
    let _ = child.wait();
}
