//! Remote command execution over SSH.
//!
//! `SshExecutor` drives the OpenSSH client. Each `Session` owns a
//! ControlMaster socket in a private temp directory, so commands on one
//! session reuse one authenticated connection. Children are spawned with
//! `kill_on_drop`, which makes every timeout a hard kill.

use crate::constants;
use crate::error::{Error, Result};
use crate::fleet::commands;
use crate::models::vault_config::SshSection;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

/// How a session authenticates. Passwords are never used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    PrivateKey(PathBuf),
    /// Keys from the running agent or the client's default identities.
    Agent,
}

impl Credential {
    pub fn from_identity(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Credential::PrivateKey(p.to_path_buf()),
            None => Credential::Agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Registry name, used in errors and logs.
    pub host: String,
    pub address: String,
    pub port: u16,
    pub principal: String,
}

impl Target {
    pub fn new(host: &str, address: &str, port: u16, principal: &str) -> Self {
        Self {
            host: host.to_string(),
            address: address.to_string(),
            port,
            principal: principal.to_string(),
        }
    }
}

/// An authenticated connection to one host. Owned by one task.
#[derive(Debug)]
pub struct Session {
    target: Target,
    credential: Credential,
    sudo: bool,
    control_dir: Option<TempDir>,
}

impl Session {
    pub fn new(target: Target, credential: Credential) -> Self {
        Self {
            target,
            credential,
            sudo: false,
            control_dir: None,
        }
    }

    /// Route privileged commands through `sudo -n`. Never set for root.
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo && self.target.principal != "root";
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn sudo(&self) -> bool {
        self.sudo
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control_dir.as_ref().map(|d| d.path().join("cm"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty stderr line, else stdout, for error details.
    pub fn summary(&self) -> String {
        let pick = |s: &str| s.lines().map(str::trim).find(|l| !l.is_empty()).map(String::from);
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_else(|| format!("exit status {}", self.exit_code))
    }
}

fn remaining(deadline: Instant, total: Duration, operation: &str) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(Error::timeout(operation, total))
    } else {
        Ok(left)
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, target: &Target, credential: &Credential) -> Result<Session>;

    async fn run(&self, session: &Session, command: &str, timeout: Duration) -> Result<CommandOutput>;

    async fn run_with_input(
        &self,
        session: &Session,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn close(&self, session: Session);

    /// Upload `script` to a private temp path, run it with `args`, and
    /// remove it on every exit path. `timeout` bounds the whole sequence.
    /// Runs through sudo when the session requests it.
    async fn upload_and_run(
        &self,
        session: &Session,
        script: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let deadline = Instant::now() + timeout;
        let op = "upload and run script";

        let created = self
            .run(session, commands::MKTEMP_SCRIPT, remaining(deadline, timeout, op)?)
            .await?;
        if !created.success() {
            return Ok(created);
        }
        let path = created.stdout.trim().to_string();
        if path.is_empty() {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "mktemp returned no path".into(),
            });
        }

        let result: Result<CommandOutput> = async {
            let written = self
                .run_with_input(
                    session,
                    &commands::write_stdin_to(&path),
                    script.as_bytes(),
                    remaining(deadline, timeout, op)?,
                )
                .await?;
            if !written.success() {
                return Ok(written);
            }
            let chmod = self
                .run(session, &commands::make_executable(&path), remaining(deadline, timeout, op)?)
                .await?;
            if !chmod.success() {
                return Ok(chmod);
            }
            self.run(
                session,
                &commands::run_script(&path, args, session.sudo()),
                remaining(deadline, timeout, op)?,
            )
            .await
        }
        .await;

        let cleanup = Duration::from_secs(constants::CLEANUP_TIMEOUT_SECS);
        match self.run(session, &commands::remove_file(&path), cleanup).await {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(host = %session.target().host, path = %path, detail = %out.summary(), "remote script cleanup failed"),
            Err(e) => tracing::warn!(host = %session.target().host, path = %path, error = %e, "remote script cleanup failed"),
        }
        result
    }
}

/// Exit 255 is the client's own failure. Split rejections from the rest.
pub fn classify_ssh_failure(target: &Target, stderr: &str) -> Error {
    let message = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("ssh exited with status 255")
        .to_string();
    if stderr.contains("Permission denied") || stderr.contains("Too many authentication failures") {
        Error::Auth {
            host: target.host.clone(),
            principal: target.principal.clone(),
            message,
        }
    } else {
        Error::Connect {
            host: target.host.clone(),
            message,
        }
    }
}

/// OpenSSH client wrapper.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    binary: String,
    connect_timeout: Duration,
    strict_host_key_checking: String,
}

impl SshExecutor {
    pub fn new(config: &SshSection) -> Self {
        Self {
            binary: config.ssh_binary.clone(),
            connect_timeout: config.connect_timeout(),
            strict_host_key_checking: config.strict_host_key_checking.clone(),
        }
    }

    /// Options shared by every invocation for `target`.
    pub fn base_args(&self, target: &Target, credential: &Credential) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-p".into(),
            target.port.to_string(),
            "-l".into(),
            target.principal.clone(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "PasswordAuthentication=no".into(),
            "-o".into(),
            "KbdInteractiveAuthentication=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".into(),
            format!("StrictHostKeyChecking={}", self.strict_host_key_checking),
        ];
        if let Credential::PrivateKey(path) = credential {
            args.push("-i".into());
            args.push(path.display().to_string());
            args.push("-o".into());
            args.push("IdentitiesOnly=yes".into());
        }
        args
    }

    fn session_command(&self, session: &Session) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.base_args(&session.target, &session.credential));
        if let Some(path) = session.control_path() {
            cmd.arg("-o").arg("ControlMaster=no");
            cmd.arg("-o").arg(format!("ControlPath={}", path.display()));
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn execute(
        &self,
        session: &Session,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let target = &session.target;
        let mut cmd = self.session_command(session);
        cmd.arg("--")
            .arg(&target.address)
            .arg(command)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(host = %target.host, principal = %target.principal, "ssh exec");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io_context(e, format!("spawn {}", self.binary)))?;

        let io = async move {
            if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(data).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(timeout, io).await {
            Ok(out) => out.map_err(|e| Error::io_context(e, format!("ssh to {}", target.host)))?,
            // child dropped here; kill_on_drop terminates it
            Err(_) => {
                return Err(Error::timeout(
                    format!("remote command on {}", target.host),
                    timeout,
                ))
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == 255 {
            return Err(classify_ssh_failure(target, &stderr));
        }
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}

#[async_trait]
impl RemoteShell for SshExecutor {
    async fn connect(&self, target: &Target, credential: &Credential) -> Result<Session> {
        let dir = tempfile::Builder::new()
            .prefix("fleet-vault-ssh-")
            .tempdir()
            .map_err(|e| Error::io_context(e, "create ssh control directory"))?;
        let control = dir.path().join("cm");

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.base_args(target, credential))
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg("-o")
            .arg("ControlPersist=60")
            .arg("-f")
            .arg("-N")
            .arg("--")
            .arg(&target.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        // the backgrounded master inherits stderr; a pipe would never reach EOF
        let err_path = dir.path().join("connect.err");
        let err_file = std::fs::File::create(&err_path)
            .map_err(|e| Error::io_context(e, "create ssh stderr capture"))?;
        cmd.stderr(Stdio::from(err_file));

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io_context(e, format!("spawn {}", self.binary)))?;
        let limit = self.connect_timeout + Duration::from_secs(5);
        let status = tokio::time::timeout(limit, child.wait())
            .await
            .map_err(|_| Error::timeout(format!("ssh connect to {}", target.host), limit))?
            .map_err(|e| Error::io_context(e, format!("ssh connect to {}", target.host)))?;

        if !status.success() {
            let stderr = tokio::fs::read_to_string(&err_path).await.unwrap_or_default();
            return Err(classify_ssh_failure(target, &stderr));
        }
        tracing::debug!(host = %target.host, principal = %target.principal, "ssh session opened");

        let mut session = Session::new(target.clone(), credential.clone());
        session.control_dir = Some(dir);
        Ok(session)
    }

    async fn run(&self, session: &Session, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.execute(session, command, None, timeout).await
    }

    async fn run_with_input(
        &self,
        session: &Session,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.execute(session, command, Some(input), timeout).await
    }

    async fn close(&self, session: Session) {
        let Some(path) = session.control_path() else {
            return;
        };
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", path.display()))
            .arg("-O")
            .arg("exit")
            .arg("--")
            .arg(&session.target.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let limit = Duration::from_secs(constants::CLEANUP_TIMEOUT_SECS);
        match cmd.spawn() {
            Ok(child) => {
                if tokio::time::timeout(limit, child.wait_with_output()).await.is_err() {
                    tracing::warn!(host = %session.target.host, "ssh control master did not exit");
                }
            }
            Err(e) => tracing::warn!(host = %session.target.host, error = %e, "ssh -O exit failed"),
        }
        tracing::debug!(host = %session.target.host, "ssh session closed");
    }
}
