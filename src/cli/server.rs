use crate::cli::secret::{parse_address, parse_principal, parse_server};
use crate::cli::provision::print_steps;
use crate::cli::{health, local_time, print_json, CliContext, OutputFormat};
use crate::models::provisioning::Overall;
use crate::models::server::ServerRecord;
use anyhow::{bail, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// Register a server
    Add {
        #[arg(value_parser = parse_server)]
        hostname: String,

        /// Address used for SSH (default: the hostname)
        #[arg(long, default_value = "", value_parser = parse_address)]
        ip: String,

        #[arg(long, default_value_t = 22)]
        port: u16,

        /// Admin principal (default: provisioning.admin_principal)
        #[arg(long, value_parser = parse_principal)]
        admin: Option<String>,

        /// Run a health check after adding
        #[arg(long)]
        test: bool,

        /// Provision the admin principal after adding
        #[arg(long)]
        provision: bool,
    },
    /// Remove a server; its live secrets become orphaned
    Remove {
        #[arg(value_parser = parse_server)]
        hostname: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List registered servers
    List {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Check whether an account exists on a server
    ValidateUser {
        #[arg(long, value_parser = parse_server)]
        server: String,

        #[arg(long, value_parser = parse_principal)]
        username: String,
    },
    /// Set an account's password on the server to the current vault secret
    DeploySecret {
        #[arg(long, value_parser = parse_server)]
        server: String,

        #[arg(long, value_parser = parse_principal)]
        username: String,

        #[arg(long)]
        yes: bool,
    },
}

pub async fn run(ctx: &CliContext, cmd: ServerCommand) -> Result<()> {
    match cmd {
        ServerCommand::Add {
            hostname,
            ip,
            port,
            admin,
            test,
            provision,
        } => run_add(ctx, hostname, ip, port, admin, test, provision).await,
        ServerCommand::Remove { hostname, yes } => run_remove(ctx, &hostname, yes),
        ServerCommand::List { format } => run_list(ctx, format),
        ServerCommand::ValidateUser { server, username } => {
            let manager = ctx.manager()?;
            if manager.validate_user(&ctx.auth, &server, &username).await? {
                println!("{} exists on {}", username, server);
                Ok(())
            } else {
                println!("{} does not exist on {}", username, server);
                std::process::exit(1);
            }
        }
        ServerCommand::DeploySecret {
            server,
            username,
            yes,
        } => {
            let prompt = format!(
                "Set the password of {} on {} to the current vault secret?",
                username, server
            );
            if !ctx.confirm(&prompt, yes)? {
                println!("Aborted.");
                return Ok(());
            }
            let manager = ctx.manager()?;
            let meta = manager.deploy_secret(&ctx.auth, &server, &username).await?;
            println!(
                "Deployed version {} for {}@{}",
                meta.version_id, meta.principal, meta.server
            );
            Ok(())
        }
    }
}

async fn run_add(
    ctx: &CliContext,
    hostname: String,
    ip: String,
    port: u16,
    admin: Option<String>,
    test: bool,
    provision: bool,
) -> Result<()> {
    let manager = ctx.manager()?;
    let admin = admin.unwrap_or_else(|| manager.config().provisioning.admin_principal.clone());
    let record = manager.add_server(&ctx.auth, ServerRecord::new(&hostname, &ip, port, &admin))?;
    println!(
        "Added {} ({}:{}, admin {})",
        record.hostname,
        record.address(),
        record.ssh_port,
        record.admin_principal
    );

    if test {
        let outcome = manager
            .health(&ctx.auth, std::slice::from_ref(&hostname), false)
            .await?;
        health::print_reports(outcome.results.values());
    }

    if provision {
        let result = manager.provision_host(&ctx.auth, &hostname, None).await?;
        print_steps(&result);
        if result.overall == Overall::Failure {
            bail!("provisioning {} failed", hostname);
        }
    }
    Ok(())
}

fn run_remove(ctx: &CliContext, hostname: &str, yes: bool) -> Result<()> {
    let prompt = format!(
        "Remove {} from the registry? Its live secrets will be orphaned.",
        hostname
    );
    if !ctx.confirm(&prompt, yes)? {
        println!("Aborted.");
        return Ok(());
    }
    let manager = ctx.manager()?;
    let (removed, orphaned) = manager.remove_server(&ctx.auth, hostname)?;
    println!("Removed {}", removed.hostname);
    if !orphaned.is_empty() {
        println!("Orphaned secrets: {}", orphaned.join(", "));
    }
    Ok(())
}

fn run_list(ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let manager = ctx.manager()?;
    let servers = manager.list_servers(&ctx.auth)?;

    if format == OutputFormat::Json {
        return print_json(&servers);
    }
    if servers.is_empty() {
        println!("No servers registered");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Hostname").add_attribute(Attribute::Bold),
        Cell::new("Address").add_attribute(Attribute::Bold),
        Cell::new("Port").add_attribute(Attribute::Bold),
        Cell::new("Admin").add_attribute(Attribute::Bold),
        Cell::new("Status").add_attribute(Attribute::Bold),
        Cell::new("Last checked").add_attribute(Attribute::Bold),
    ]);
    for s in &servers {
        table.add_row(vec![
            s.hostname.clone(),
            s.address().to_string(),
            s.ssh_port.to_string(),
            s.admin_principal.clone(),
            s.last_status
                .map(|st| st.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            s.last_checked
                .map(local_time)
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{}", table);
    Ok(())
}
