//! Diagnostics for vault installation and fleet readiness.

use crate::cli::CliContext;
use crate::constants;
use crate::core::codec::MasterKey;
use crate::core::registry::Registry;
use crate::core::{audit_log, config};
use crate::fleet::provision;
use crate::util::fs as vault_fs;
use anyhow::Result;
use clap::Args;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Skip the audit chain check (slow on large logs)
    #[arg(long)]
    pub skip_audit: bool,
}

#[derive(Default)]
struct Tally {
    ok: u32,
    warn: u32,
    fail: u32,
}

impl Tally {
    fn pass(&mut self, msg: impl AsRef<str>) {
        println!("  [PASS] {}", msg.as_ref());
        self.ok += 1;
    }

    fn warn(&mut self, msg: impl AsRef<str>) {
        println!("  [WARN] {}", msg.as_ref());
        self.warn += 1;
    }

    fn fail(&mut self, msg: impl AsRef<str>) {
        println!("  [FAIL] {}", msg.as_ref());
        self.fail += 1;
    }
}

fn binary_runs(program: &str, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn resolve(root: &Path, path: &Path) -> std::path::PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

pub fn run(ctx: &CliContext, args: DoctorArgs) -> Result<()> {
    let paths = &ctx.paths;
    let mut t = Tally::default();

    println!("Doctor: {}", paths.root.display());

    if paths.root.is_dir() {
        t.pass(format!("vault root exists: {}", paths.root.display()));
    } else {
        t.fail(format!(
            "vault root missing: {} (run: fleet-vault init)",
            paths.root.display()
        ));
    }

    let vault = match config::load(&paths.config) {
        Ok(v) => {
            if paths.config.exists() {
                t.pass(format!("config valid: {}", paths.config.display()));
            } else {
                t.warn("config file absent; using defaults");
            }
            v
        }
        Err(e) => {
            t.fail(format!("config invalid: {}", e));
            println!();
            println!("Doctor summary: {} pass, {} warn, {} fail", t.ok, t.warn, t.fail);
            std::process::exit(1);
        }
    };

    match vault_fs::mode_of(&paths.vault) {
        Some(mode) if mode == constants::VAULT_DIR_MODE => {
            t.pass(format!("vault dir mode ok: {:04o}", mode))
        }
        Some(mode) => t.warn(format!(
            "vault dir mode: {:04o} (expected {:04o})",
            mode,
            constants::VAULT_DIR_MODE
        )),
        None => t.fail(format!("vault dir missing: {}", paths.vault.display())),
    }

    let key_path = config::master_key_path(paths, &vault);
    match MasterKey::load(&key_path) {
        Ok(_) => t.pass(format!("master key usable: {}", key_path.display())),
        Err(e) => t.fail(e.to_string()),
    }

    match Registry::new(paths).list() {
        Ok(servers) => t.pass(format!("registry readable ({} servers)", servers.len())),
        Err(e) => t.fail(format!("registry: {}", e)),
    }

    if binary_runs(&vault.ssh.ssh_binary, "-V") {
        t.pass(format!("{} available", vault.ssh.ssh_binary));
    } else {
        t.fail(format!("{} not found on PATH", vault.ssh.ssh_binary));
    }
    if binary_runs("ping", "-V") {
        t.pass("ping available");
    } else {
        t.warn("ping not found; reachability falls back to TCP probes");
    }

    match &vault.ssh.identity_file {
        Some(id) if resolve(&paths.root, id).is_file() => {
            t.pass(format!("operator identity: {}", id.display()))
        }
        Some(id) => t.fail(format!("operator identity missing: {}", id.display())),
        None => t.warn("ssh.identity_file not set; relying on ssh-agent"),
    }

    match &vault.provisioning.public_key_path {
        Some(p) => {
            let path = resolve(&paths.root, p);
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| provision::normalize_public_key(&raw).map_err(|e| e.to_string()))
            {
                Ok(_) => t.pass(format!("provisioning public key: {}", path.display())),
                Err(e) => t.fail(format!("provisioning public key {}: {}", path.display(), e)),
            }
        }
        None => t.warn("provisioning.public_key_path not set; provision is unavailable"),
    }

    if !args.skip_audit {
        match audit_log::verify_chain(paths) {
            Ok((0, _)) => t.pass("audit log empty"),
            Ok((total, errors)) if errors.is_empty() => {
                t.pass(format!("audit chain intact ({} entries)", total))
            }
            Ok((total, errors)) => t.fail(format!(
                "audit chain: {} errors in {} entries (run: fleet-vault audit verify)",
                errors.len(),
                total
            )),
            Err(e) => t.fail(format!("audit log: {}", e)),
        }
    }

    println!();
    println!("Doctor summary: {} pass, {} warn, {} fail", t.ok, t.warn, t.fail);
    if t.fail > 0 {
        std::process::exit(1);
    }
    Ok(())
}
