//! In-memory host for exercising the fleet layer without a network.
//!
//! Understands exactly the command text produced by `fleet::commands`.
//! Anything else exits 127, so a drifting builder shows up as a test failure.

use crate::constants;
use crate::error::{Error, Result};
use crate::fleet::commands;
use crate::fleet::probe::NetworkProbe;
use crate::fleet::ssh::{CommandOutput, Credential, RemoteShell, Session, Target};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

pub const TEST_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITestKey fleet@operator";

const SNAPSHOT: &str = "2\n\
0.50 0.40 0.30 1/120 4242\n\
MemTotal:        8000000 kB\n\
MemAvailable:    6000000 kB\n\
Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
/dev/vda1         41152736 17284149  23868587      42% /\n";

#[derive(Default)]
struct User {
    keys: Vec<String>,
    locked: bool,
    password: Option<String>,
}

struct State {
    bootstrap: String,
    auth_ok: bool,
    port_open: bool,
    pingable: bool,
    visudo_ok: bool,
    script_fails: bool,
    down: BTreeSet<String>,
    users: BTreeMap<String, User>,
    sudoers: BTreeMap<String, String>,
    sudoers_writes: usize,
    scripts: BTreeMap<String, Option<String>>,
    next_tmp: usize,
    fail_runs: usize,
    latency: Duration,
    open_sessions: usize,
    active: usize,
    peak: usize,
    commands_run: usize,
    sudo_commands: usize,
    connects: Vec<(String, Credential)>,
}

pub struct FakeHost {
    state: Mutex<State>,
}

fn out(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

fn ok() -> CommandOutput {
    out(0, "", "")
}

fn status(success: bool) -> CommandOutput {
    if success {
        ok()
    } else {
        out(1, "", "")
    }
}

/// Every single-quoted word in `s`, undoing `shell_quote` escaping.
fn quoted_args(s: &str) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\'' {
            i += 1;
            continue;
        }
        let mut word = String::new();
        i += 1;
        loop {
            while i < chars.len() && chars[i] != '\'' {
                word.push(chars[i]);
                i += 1;
            }
            i += 1;
            if chars.get(i) == Some(&'\\')
                && chars.get(i + 1) == Some(&'\'')
                && chars.get(i + 2) == Some(&'\'')
            {
                word.push('\'');
                i += 3;
            } else {
                break;
            }
        }
        args.push(word);
    }
    args
}

impl FakeHost {
    /// A reachable host where `bootstrap` already has trusted access.
    pub fn new(bootstrap: &str) -> Self {
        let mut users = BTreeMap::new();
        users.insert("root".to_string(), User::default());
        users.insert(bootstrap.to_string(), User::default());
        Self {
            state: Mutex::new(State {
                bootstrap: bootstrap.to_string(),
                auth_ok: true,
                port_open: true,
                pingable: true,
                visudo_ok: true,
                script_fails: false,
                down: BTreeSet::new(),
                users,
                sudoers: BTreeMap::new(),
                sudoers_writes: 0,
                scripts: BTreeMap::new(),
                next_tmp: 0,
                fail_runs: 0,
                latency: Duration::ZERO,
                open_sessions: 0,
                active: 0,
                peak: 0,
                commands_run: 0,
                sudo_commands: 0,
                connects: Vec::new(),
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_auth_ok(&self, v: bool) {
        self.with(|s| s.auth_ok = v);
    }

    pub fn set_port_open(&self, v: bool) {
        self.with(|s| s.port_open = v);
    }

    pub fn set_pingable(&self, v: bool) {
        self.with(|s| s.pingable = v);
    }

    pub fn set_visudo_ok(&self, v: bool) {
        self.with(|s| s.visudo_ok = v);
    }

    pub fn set_script_fails(&self, v: bool) {
        self.with(|s| s.script_fails = v);
    }

    /// Every command sleeps this long; longer than its timeout means a timeout.
    pub fn set_latency(&self, latency: Duration) {
        self.with(|s| s.latency = latency);
    }

    /// Make one address unreachable, leaving the others up.
    pub fn take_down(&self, address: &str) {
        self.with(|s| {
            s.down.insert(address.to_string());
        });
    }

    /// The next `n` commands fail with a transient connection error.
    pub fn fail_next_runs(&self, n: usize) {
        self.with(|s| s.fail_runs = n);
    }

    pub fn add_user(&self, principal: &str) {
        self.with(|s| {
            s.users.entry(principal.to_string()).or_default();
        });
    }

    pub fn add_key(&self, principal: &str, key: &str) {
        self.with(|s| {
            s.users
                .entry(principal.to_string())
                .or_default()
                .keys
                .push(key.to_string())
        });
    }

    pub fn key_count(&self, principal: &str, key: &str) -> usize {
        self.with(|s| {
            s.users
                .get(principal)
                .map(|u| u.keys.iter().filter(|k| *k == key).count())
                .unwrap_or(0)
        })
    }

    pub fn user_locked(&self, principal: &str) -> bool {
        self.with(|s| s.users.get(principal).map(|u| u.locked).unwrap_or(false))
    }

    pub fn password_of(&self, principal: &str) -> Option<String> {
        self.with(|s| s.users.get(principal).and_then(|u| u.password.clone()))
    }

    pub fn has_sudoers(&self, path: &str) -> bool {
        self.with(|s| s.sudoers.contains_key(path))
    }

    pub fn sudoers_writes(&self) -> usize {
        self.with(|s| s.sudoers_writes)
    }

    pub fn leftover_scripts(&self) -> usize {
        self.with(|s| s.scripts.len())
    }

    pub fn commands_run(&self) -> usize {
        self.with(|s| s.commands_run)
    }

    pub fn sudo_commands(&self) -> usize {
        self.with(|s| s.sudo_commands)
    }

    pub fn open_sessions(&self) -> usize {
        self.with(|s| s.open_sessions)
    }

    /// Highest number of commands in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.with(|s| s.peak)
    }

    pub fn connects_as(&self, principal: &str) -> usize {
        self.with(|s| s.connects.iter().filter(|(p, _)| p == principal).count())
    }

    pub fn last_credential_for(&self, principal: &str) -> Option<Credential> {
        self.with(|s| {
            s.connects
                .iter()
                .rev()
                .find(|(p, _)| p == principal)
                .map(|(_, c)| c.clone())
        })
    }

    fn is_up(&self, address: &str) -> bool {
        self.with(|s| !s.down.contains(address))
    }

    async fn dispatch(
        &self,
        session: &Session,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let target = session.target();
        let latency = self.with(|s| {
            s.commands_run += 1;
            s.active += 1;
            s.peak = s.peak.max(s.active);
            s.latency
        });
        let waited = if latency > timeout { timeout } else { latency };
        if !waited.is_zero() {
            tokio::time::sleep(waited).await;
        }
        let result = if latency > timeout {
            Err(Error::timeout("remote command", timeout))
        } else {
            self.with(|s| {
                if s.fail_runs > 0 {
                    s.fail_runs -= 1;
                    return Err(Error::Connect {
                        host: target.host.clone(),
                        message: "connection reset by peer".into(),
                    });
                }
                Ok(s.execute(&target.principal, command, input))
            })
        };
        self.with(|s| s.active -= 1);
        result
    }
}

impl State {
    fn key_present(&self, principal: &str, key: &str) -> bool {
        self.users
            .get(principal)
            .map(|u| u.keys.iter().any(|k| k == key))
            .unwrap_or(false)
    }

    fn granted(&self, principal: &str) -> bool {
        principal == "root"
            || self
                .sudoers
                .values()
                .any(|line| *line == commands::sudoers_line(principal))
    }

    fn execute(&mut self, login: &str, command: &str, input: Option<&[u8]>) -> CommandOutput {
        let (command, elevated) = match command.strip_prefix("sudo -n sh -c ") {
            Some(rest) => {
                self.sudo_commands += 1;
                if !self.granted(login) && login != self.bootstrap {
                    return out(1, "", "sudo: a password is required");
                }
                (quoted_args(rest).into_iter().next().unwrap_or_default(), true)
            }
            None => (command.to_string(), login == "root"),
        };
        let command = command.as_str();
        let args = quoted_args(command);
        let denied = || out(1, "", "Permission denied");

        if command == commands::WHOAMI {
            return out(0, &format!("{}\n", login), "");
        }
        if command == constants::RESOURCE_SNAPSHOT_COMMAND {
            return out(0, SNAPSHOT, "");
        }
        if command == "true" {
            return ok();
        }
        if command == "sudo -n true" {
            return if self.granted(login) {
                ok()
            } else {
                out(1, "", "sudo: a password is required")
            };
        }
        if command == commands::MKTEMP_SCRIPT {
            self.next_tmp += 1;
            let path = format!("/tmp/fleet-vault.{:010}", self.next_tmp);
            self.scripts.insert(path.clone(), None);
            return out(0, &format!("{}\n", path), "");
        }
        if command == commands::CHPASSWD {
            if !elevated {
                return denied();
            }
            let text = String::from_utf8_lossy(input.unwrap_or_default()).to_string();
            for line in text.lines() {
                let Some((user, password)) = line.split_once(':') else {
                    return out(1, "", "chpasswd: line 1: missing new password");
                };
                match self.users.get_mut(user) {
                    Some(u) => u.password = Some(password.to_string()),
                    None => return out(1, "", "chpasswd: user does not exist"),
                }
            }
            return ok();
        }
        if command.starts_with("id -u ") {
            return status(self.users.contains_key(&args[0]));
        }
        if command.starts_with("useradd ") {
            if !elevated {
                return denied();
            }
            let user = self.users.entry(args[0].clone()).or_default();
            user.locked = true;
            return ok();
        }
        if command.starts_with("home=$(getent passwd ") {
            let (principal, key) = (&args[0], &args[1]);
            if !self.users.contains_key(principal) {
                return out(1, "", "");
            }
            let present = self.key_present(principal, key);
            if command.contains("sudo -n -l -U") {
                return status(present && self.granted(principal));
            }
            return status(present);
        }
        if command.starts_with("grep -qxF ") {
            let (line, path) = (&args[0], &args[1]);
            return status(self.sudoers.get(path) == Some(line));
        }
        if command.starts_with("tmp=$(mktemp)") {
            if !elevated {
                return denied();
            }
            if !self.visudo_ok {
                return out(1, "", "visudo: syntax error near line 1");
            }
            let n = args.len();
            self.sudoers.insert(args[n - 1].clone(), args[n - 2].clone());
            self.sudoers_writes += 1;
            return ok();
        }
        if command.starts_with("umask 077 && cat > ") {
            let script = String::from_utf8_lossy(input.unwrap_or_default()).to_string();
            return match self.scripts.get_mut(&args[0]) {
                Some(slot) => {
                    *slot = Some(script);
                    ok()
                }
                None => out(1, "", "No such file or directory"),
            };
        }
        if command.starts_with("chmod 700 ") {
            return status(self.scripts.contains_key(&args[0]));
        }
        if command.starts_with("rm -f ") {
            self.scripts.remove(&args[0]);
            return ok();
        }
        if command.starts_with("'/tmp/fleet-vault.") {
            if !elevated {
                return denied();
            }
            match self.scripts.get(&args[0]) {
                Some(Some(script)) if script == commands::INSTALL_KEY_SCRIPT => {}
                _ => return out(126, "", "cannot execute"),
            }
            if self.script_fails {
                return out(1, "", "install: cannot create directory");
            }
            let (principal, key) = (&args[1], &args[2]);
            let Some(user) = self.users.get_mut(principal) else {
                return out(1, "", &format!("no home directory for {}", principal));
            };
            if !user.keys.iter().any(|k| k == key) {
                user.keys.push(key.clone());
            }
            return ok();
        }
        out(127, "", &format!("sh: command not found: {}", command))
    }
}

#[async_trait]
impl RemoteShell for FakeHost {
    async fn connect(&self, target: &Target, credential: &Credential) -> Result<Session> {
        if !self.is_up(&target.address) {
            return Err(Error::Connect {
                host: target.host.clone(),
                message: "No route to host".into(),
            });
        }
        self.with(|s| {
            s.connects.push((target.principal.clone(), credential.clone()));
            if !s.port_open {
                return Err(Error::Connect {
                    host: target.host.clone(),
                    message: "Connection refused".into(),
                });
            }
            let accepted = if target.principal == s.bootstrap {
                s.auth_ok
            } else {
                s.users
                    .get(&target.principal)
                    .map(|u| !u.keys.is_empty())
                    .unwrap_or(false)
            };
            if !accepted {
                return Err(Error::Auth {
                    host: target.host.clone(),
                    principal: target.principal.clone(),
                    message: "Permission denied (publickey)".into(),
                });
            }
            s.open_sessions += 1;
            Ok(Session::new(target.clone(), credential.clone()))
        })
    }

    async fn run(&self, session: &Session, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.dispatch(session, command, None, timeout).await
    }

    async fn run_with_input(
        &self,
        session: &Session,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.dispatch(session, command, Some(input), timeout).await
    }

    async fn close(&self, _session: Session) {
        self.with(|s| s.open_sessions -= 1);
    }
}

#[async_trait]
impl NetworkProbe for FakeHost {
    async fn ping(&self, address: &str, _timeout: Duration) -> Result<String> {
        if self.is_up(address) && self.with(|s| s.pingable) {
            Ok(format!("{} answered ping", address))
        } else {
            Err(Error::Connect {
                host: address.to_string(),
                message: "no ping reply".into(),
            })
        }
    }

    async fn tcp_connect(&self, address: &str, port: u16, _timeout: Duration) -> Result<()> {
        if self.is_up(address) && self.with(|s| s.port_open) {
            Ok(())
        } else {
            Err(Error::Connect {
                host: address.to_string(),
                message: format!("port {} closed", port),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::commands::shell_quote;

    #[test]
    fn test_quoted_args_undo_shell_quote() {
        let words = ["plain", "it's", "a b c", ""];
        let line: Vec<String> = words.iter().map(|w| shell_quote(w)).collect();
        assert_eq!(quoted_args(&line.join(" ")), words.to_vec());
    }

    #[test]
    fn test_unknown_command_exits_127() {
        let mut host = FakeHost::new("root");
        let state = host.state.get_mut().unwrap();
        assert_eq!(state.execute("root", "reboot", None).exit_code, 127);
    }
}
