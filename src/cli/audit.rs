use crate::cli::secret::parse_server;
use crate::cli::{local_time, print_json, CliContext, OutputFormat};
use anyhow::Result;
use clap::{Args, Subcommand};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Display the audit trail
    Log(AuditLogArgs),
    /// Verify audit chain integrity
    Verify(AuditVerifyArgs),
}

#[derive(Args, Debug)]
pub struct AuditLogArgs {
    /// Maximum number of entries to display
    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    /// Only entries for this server
    #[arg(long, value_parser = parse_server)]
    pub server: Option<String>,

    /// Only failed or denied operations
    #[arg(long)]
    pub failures: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct AuditVerifyArgs {}

pub fn run(ctx: &CliContext, cmd: AuditCommand) -> Result<()> {
    match cmd {
        AuditCommand::Log(args) => run_log(ctx, args),
        AuditCommand::Verify(_) => run_verify(ctx),
    }
}

fn run_log(ctx: &CliContext, args: AuditLogArgs) -> Result<()> {
    let manager = ctx.manager()?;
    let filtered = args.server.is_some() || args.failures;
    let limit = if filtered { None } else { Some(args.limit) };
    let mut entries: Vec<_> = manager
        .audit_entries(&ctx.auth, limit)?
        .into_iter()
        .filter(|e| args.server.is_none() || e.server == args.server)
        .filter(|e| !args.failures || !e.result.success)
        .collect();
    if entries.len() > args.limit {
        entries.drain(..entries.len() - args.limit);
    }

    if args.format == OutputFormat::Json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No audit entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Timestamp").add_attribute(Attribute::Bold),
        Cell::new("Action").add_attribute(Attribute::Bold),
        Cell::new("Server").add_attribute(Attribute::Bold),
        Cell::new("Principal").add_attribute(Attribute::Bold),
        Cell::new("Actor").add_attribute(Attribute::Bold),
        Cell::new("Detail").add_attribute(Attribute::Bold),
        Cell::new("Result").add_attribute(Attribute::Bold),
    ]);

    for entry in &entries {
        let result_str = if entry.result.success {
            "OK".to_string()
        } else {
            format!("FAIL: {}", entry.result.error.as_deref().unwrap_or("?"))
        };
        table.add_row(vec![
            local_time(entry.timestamp),
            entry.action.clone(),
            entry.server.clone().unwrap_or_default(),
            entry.principal.clone().unwrap_or_default(),
            entry.actor.clone(),
            entry.detail.clone().unwrap_or_default(),
            result_str,
        ]);
    }

    println!("{}", table);
    println!("\n{} entries shown.", entries.len());
    Ok(())
}

fn run_verify(ctx: &CliContext) -> Result<()> {
    let manager = ctx.manager()?;
    let (total, errors) = manager.verify_audit(&ctx.auth)?;

    if total == 0 {
        println!("No audit entries to verify.");
        return Ok(());
    }

    for err in &errors {
        println!("  [FAIL] {}", err);
    }

    println!();
    if errors.is_empty() {
        println!("Audit chain: {} entries verified, 0 errors", total);
    } else {
        println!("Audit chain: {} entries, {} errors", total, errors.len());
        std::process::exit(1);
    }
    Ok(())
}
