//! CLI routing and command dispatch.

use crate::api::{AuthContext, FleetManager};
use crate::core::paths::VaultPaths;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;

pub mod audit;
pub mod doctor;
pub mod health;
pub mod init;
pub mod provision;
pub mod secret;
pub mod server;

/// Shared context passed to all command handlers.
pub struct CliContext {
    pub paths: VaultPaths,
    pub non_interactive: bool,
    pub auth: AuthContext,
}

impl CliContext {
    /// Open the vault. Fails when the master key is missing or unusable.
    pub fn manager(&self) -> Result<FleetManager> {
        FleetManager::open(self.paths.clone()).with_context(|| {
            format!(
                "cannot open vault at {} (run: fleet-vault init --generate-key)",
                self.paths.root.display()
            )
        })
    }

    /// Ask before a destructive step. Non-interactive runs need `assume_yes`.
    pub fn confirm(&self, prompt: &str, assume_yes: bool) -> Result<bool> {
        if assume_yes {
            return Ok(true);
        }
        if self.non_interactive {
            bail!("refusing to prompt in --non-interactive mode (pass --yes)");
        }
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("read confirmation")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

pub(crate) fn local_time(ts: DateTime<Utc>) -> String {
    let local: DateTime<Local> = ts.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{}", json);
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "fleet-vault",
    version,
    about = "Credential vault and SSH provisioning for a server fleet"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub root: Option<std::path::PathBuf>,

    /// Run in non-interactive mode (no prompts, suitable for automation)
    #[arg(long, global = true, env = "FLEET_VAULT_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default tracing filter when FLEET_VAULT_LOG is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    pub async fn run(self) -> Result<()> {
        let paths = VaultPaths::resolve(self.root)?;
        let ctx = CliContext {
            paths,
            non_interactive: self.non_interactive,
            auth: AuthContext::local_operator(),
        };

        match self.command {
            Commands::Init(args) => init::run(&ctx, args),
            Commands::CreateSecret(args) => secret::run_create(&ctx, args),
            Commands::RetrieveSecret(args) => secret::run_retrieve(&ctx, args),
            Commands::RotateSecret(args) => secret::run_rotate(&ctx, args),
            Commands::ListSecrets(args) => secret::run_list(&ctx, args),
            Commands::ShowHistory(args) => secret::run_history(&ctx, args),
            Commands::Server { command } => server::run(&ctx, command).await,
            Commands::Health(args) => health::run(&ctx, args).await,
            Commands::Provision(args) => provision::run(&ctx, args).await,
            Commands::Audit { command } => audit::run(&ctx, command),
            Commands::Doctor(args) => doctor::run(&ctx, args),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the vault layout, default config and (optionally) the master key
    Init(init::InitArgs),
    /// Generate and store a secret for a principal on a server
    CreateSecret(secret::CreateArgs),
    /// Decrypt the current secret
    RetrieveSecret(secret::RetrieveArgs),
    /// Store a new version and make it current
    RotateSecret(secret::RotateArgs),
    /// List live secrets (metadata only)
    ListSecrets(secret::ListArgs),
    /// Show version history for a server
    ShowHistory(secret::HistoryArgs),
    /// Manage the server registry
    Server {
        #[command(subcommand)]
        command: server::ServerCommand,
    },
    /// Probe hosts and record their status
    Health(health::HealthArgs),
    /// Establish key-based admin access on hosts
    Provision(provision::ProvisionArgs),
    /// View or verify the audit trail
    Audit {
        #[command(subcommand)]
        command: audit::AuditCommand,
    },
    /// Diagnose installation and configuration (safe, read-only)
    Doctor(doctor::DoctorArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_secret() {
        let cli = Cli::try_parse_from([
            "fleet-vault",
            "--root",
            "/tmp/v",
            "create-secret",
            "--server",
            "web01",
            "--username",
            "deploy",
            "--length",
            "24",
        ])
        .unwrap();
        match cli.command {
            Commands::CreateSecret(args) => {
                assert_eq!(args.server, "web01");
                assert_eq!(args.length, Some(24));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_verbosity_sets_filter() {
        let cli = Cli::try_parse_from(["fleet-vault", "-vv", "doctor"]).unwrap();
        assert_eq!(cli.log_filter(), "debug");
        let cli = Cli::try_parse_from(["fleet-vault", "doctor"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
    }

    #[test]
    fn test_health_hosts_and_flags() {
        let cli = Cli::try_parse_from([
            "fleet-vault",
            "health",
            "web01",
            "web02",
            "--targeted",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Health(args) => {
                assert_eq!(args.hosts, vec!["web01", "web02"]);
                assert!(args.targeted);
                assert_eq!(args.format, OutputFormat::Json);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_name_rejected_at_parse() {
        assert!(Cli::try_parse_from([
            "fleet-vault",
            "retrieve-secret",
            "--server",
            "../etc",
            "--username",
            "deploy",
        ])
        .is_err());
    }

    #[test]
    fn test_server_add_rejects_option_address() {
        assert!(Cli::try_parse_from([
            "fleet-vault",
            "server",
            "add",
            "web01",
            "--ip=-oProxyCommand=id",
        ])
        .is_err());
    }
}
