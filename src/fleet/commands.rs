//! Remote shell command builders.
//!
//! Every command sent to a host is built here so the exact text is
//! testable and identical between the real executor and test doubles.

use crate::models::health::ResourceSnapshot;

/// Quote for POSIX `sh`: wrap in single quotes, escape embedded ones.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Run `command` as root through non-interactive sudo when `sudo` is set.
pub fn privileged(command: &str, sudo: bool) -> String {
    if sudo {
        format!("sudo -n sh -c {}", shell_quote(command))
    } else {
        command.to_string()
    }
}

pub const WHOAMI: &str = "whoami";

pub fn principal_exists(principal: &str) -> String {
    format!("id -u {} >/dev/null 2>&1", shell_quote(principal))
}

/// Home directory, login shell, password login disabled.
pub fn create_principal(principal: &str) -> String {
    let p = shell_quote(principal);
    format!("useradd -m -s /bin/bash {0} && passwd -l {0}", p)
}

fn home_of(principal: &str) -> String {
    format!(
        "home=$(getent passwd {} | cut -d: -f6) && [ -n \"$home\" ]",
        shell_quote(principal)
    )
}

/// Exit 0 iff the exact key line is already authorized.
pub fn key_present(principal: &str, public_key: &str) -> String {
    format!(
        "{} && grep -qxF {} \"$home/.ssh/authorized_keys\"",
        home_of(principal),
        shell_quote(public_key)
    )
}

/// Uploaded and run with `principal` and `key` as arguments.
pub const INSTALL_KEY_SCRIPT: &str = r#"#!/bin/sh
set -eu
principal="$1"
key="$2"
home=$(getent passwd "$principal" | cut -d: -f6)
[ -n "$home" ] || { echo "no home directory for $principal" >&2; exit 1; }
group=$(id -gn "$principal")
install -d -m 700 -o "$principal" -g "$group" "$home/.ssh"
touch "$home/.ssh/authorized_keys"
if ! grep -qxF "$key" "$home/.ssh/authorized_keys"; then
    printf '%s\n' "$key" >> "$home/.ssh/authorized_keys"
fi
chmod 600 "$home/.ssh/authorized_keys"
chown "$principal:$group" "$home/.ssh/authorized_keys"
"#;

/// Drop-in path. sudo skips files containing `.`, so dots are replaced.
pub fn sudoers_path(prefix: &str, principal: &str) -> String {
    format!("/etc/sudoers.d/{}-{}", prefix, principal.replace('.', "_"))
}

pub fn sudoers_line(principal: &str) -> String {
    format!("{} ALL=(ALL) NOPASSWD:ALL", principal)
}

pub fn sudoers_present(path: &str, line: &str) -> String {
    format!("grep -qxF {} {}", shell_quote(line), shell_quote(path))
}

/// Stage, validate with `visudo -cf`, then install mode 0440.
pub fn install_sudoers(path: &str, line: &str) -> String {
    format!(
        "tmp=$(mktemp) && printf '%s\\n' {} > \"$tmp\" && visudo -cf \"$tmp\" >/dev/null \
         && install -m 0440 -o root -g root \"$tmp\" {}; rc=$?; rm -f \"$tmp\"; exit $rc",
        shell_quote(line),
        shell_quote(path)
    )
}

/// Privileged no-op run in a session logged in as the principal itself.
pub fn verify_privilege(principal: &str) -> String {
    if principal == "root" {
        "true".to_string()
    } else {
        "sudo -n true".to_string()
    }
}

/// Key present and NOPASSWD granted, inspected from the bootstrap session.
pub fn bootstrap_check(principal: &str, public_key: &str) -> String {
    if principal == "root" {
        return key_present(principal, public_key);
    }
    format!(
        "{} && sudo -n -l -U {} | grep -q NOPASSWD",
        key_present(principal, public_key),
        shell_quote(principal)
    )
}

/// Reads `user:password` lines on stdin.
pub const CHPASSWD: &str = "chpasswd";

pub const MKTEMP_SCRIPT: &str = "umask 077 && mktemp /tmp/fleet-vault.XXXXXXXXXX";

pub fn write_stdin_to(path: &str) -> String {
    format!("umask 077 && cat > {}", shell_quote(path))
}

pub fn make_executable(path: &str) -> String {
    format!("chmod 700 {}", shell_quote(path))
}

pub fn run_script(path: &str, args: &[String], sudo: bool) -> String {
    let mut command = shell_quote(path);
    for arg in args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    privileged(&command, sudo)
}

pub fn remove_file(path: &str) -> String {
    format!("rm -f {}", shell_quote(path))
}

/// Parse the output of `RESOURCE_SNAPSHOT_COMMAND`.
pub fn parse_resource_snapshot(output: &str) -> Option<ResourceSnapshot> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());

    let cpus: u32 = lines.next()?.parse().ok()?;
    let load1: f64 = lines.next()?.split_whitespace().next()?.parse().ok()?;

    let mut mem_total: Option<f64> = None;
    let mut mem_available: Option<f64> = None;
    let mut disk_percent: Option<f64> = None;
    for line in lines {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => mem_total = fields.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => mem_available = fields.next().and_then(|v| v.parse().ok()),
            Some("Filesystem") => {}
            Some(_) => {
                // df -P data row: fs blocks used avail capacity% mount
                let cols: Vec<&str> = line.split_whitespace().collect();
                if cols.len() >= 6 {
                    if let Some(pct) = cols[4].strip_suffix('%') {
                        disk_percent = pct.parse().ok();
                    }
                }
            }
            None => {}
        }
    }

    let total = mem_total.filter(|t| *t > 0.0)?;
    let memory_percent = (total - mem_available?) / total * 100.0;
    Some(ResourceSnapshot {
        cpus,
        load1,
        memory_percent,
        disk_percent: disk_percent?,
    })
}
