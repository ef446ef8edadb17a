use crate::cli::{local_time, print_json, CliContext, OutputFormat};
use crate::constants;
use crate::core::{registry, vault_store};
use crate::util::fs as vault_fs;
use anyhow::{bail, Context, Result};
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};
use std::io::{Read, Write};
use std::path::PathBuf;
use zeroize::Zeroizing;

pub(crate) fn parse_server(s: &str) -> Result<String, String> {
    vault_store::validate_server(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

pub(crate) fn parse_address(s: &str) -> Result<String, String> {
    registry::validate_address(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

pub(crate) fn parse_principal(s: &str) -> Result<String, String> {
    vault_store::validate_principal(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Server the secret belongs to
    #[arg(long, value_parser = parse_server)]
    pub server: String,

    /// Account on that server
    #[arg(long, value_parser = parse_principal)]
    pub username: String,

    /// Secret length (default: policy.default_length)
    #[arg(long)]
    pub length: Option<usize>,

    /// Print the generated secret to stdout
    #[arg(long)]
    pub show: bool,
}

#[derive(Args, Debug)]
pub struct RetrieveArgs {
    #[arg(long, value_parser = parse_server)]
    pub server: String,

    #[arg(long, value_parser = parse_principal)]
    pub username: String,

    /// Output file (avoid stdout)
    #[arg(long, value_name = "PATH", conflicts_with = "confirm")]
    pub output: Option<PathBuf>,

    /// Allow stdout output
    #[arg(long)]
    pub confirm: bool,
}

#[derive(Args, Debug)]
pub struct RotateArgs {
    #[arg(long, value_parser = parse_server)]
    pub server: String,

    #[arg(long, value_parser = parse_principal)]
    pub username: String,

    /// Length for the generated secret
    #[arg(long, conflicts_with = "from_stdin")]
    pub length: Option<usize>,

    /// Read the new secret from stdin instead of generating one
    #[arg(long)]
    pub from_stdin: bool,

    /// Print the generated secret to stdout
    #[arg(long, conflicts_with = "from_stdin")]
    pub show: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, value_parser = parse_server)]
    pub server: String,

    /// Restrict to one account
    #[arg(long, value_parser = parse_principal)]
    pub username: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

fn print_secret(secret: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(secret).context("write to stdout")?;
    stdout.write_all(b"\n").context("write to stdout")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}

pub fn run_create(ctx: &CliContext, args: CreateArgs) -> Result<()> {
    let manager = ctx.manager()?;
    let (meta, secret) =
        manager.create_secret(&ctx.auth, &args.server, &args.username, args.length)?;

    println!(
        "Created version {} for {}@{}",
        meta.version_id, meta.principal, meta.server
    );
    if args.show {
        print_secret(secret.as_bytes())?;
    }
    Ok(())
}

pub fn run_retrieve(ctx: &CliContext, args: RetrieveArgs) -> Result<()> {
    if args.output.is_none() && !args.confirm {
        bail!("refusing to print secret to stdout without --confirm (or use --output PATH)");
    }
    let manager = ctx.manager()?;
    let secret = manager.retrieve_secret(&ctx.auth, &args.server, &args.username)?;

    if let Some(output) = args.output {
        vault_fs::write_atomic(&output, &secret, constants::SECRET_FILE_MODE, true)?;
        println!("Wrote {}", output.display());
        return Ok(());
    }
    print_secret(&secret)
}

fn read_stdin_secret() -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::new());
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("read secret from stdin")?;
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(buf)
}

pub fn run_rotate(ctx: &CliContext, args: RotateArgs) -> Result<()> {
    let manager = ctx.manager()?;
    if args.from_stdin {
        let secret = read_stdin_secret()?;
        let meta = manager.store_secret(&ctx.auth, &args.server, &args.username, &secret)?;
        println!(
            "Rotated {}@{} to version {}",
            meta.principal, meta.server, meta.version_id
        );
        return Ok(());
    }

    let (meta, secret) =
        manager.rotate_secret(&ctx.auth, &args.server, &args.username, args.length)?;
    println!(
        "Rotated {}@{} to version {}",
        meta.principal, meta.server, meta.version_id
    );
    if args.show {
        print_secret(secret.as_bytes())?;
    }
    Ok(())
}

pub fn run_list(ctx: &CliContext, args: ListArgs) -> Result<()> {
    let manager = ctx.manager()?;
    let items = manager.list_secrets(&ctx.auth)?;

    if args.format == OutputFormat::Json {
        return print_json(&items);
    }
    if items.is_empty() {
        println!("No secrets found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Server").add_attribute(Attribute::Bold),
        Cell::new("Username").add_attribute(Attribute::Bold),
        Cell::new("Current version").add_attribute(Attribute::Bold),
        Cell::new("Created").add_attribute(Attribute::Bold),
        Cell::new("Versions").add_attribute(Attribute::Bold),
    ]);
    for item in items {
        table.add_row(vec![
            item.server,
            item.principal,
            item.version_id,
            item.created_at
                .map(local_time)
                .unwrap_or_else(|| "-".to_string()),
            item.versions.to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub fn run_history(ctx: &CliContext, args: HistoryArgs) -> Result<()> {
    let manager = ctx.manager()?;
    let versions = manager.show_history(&ctx.auth, &args.server, args.username.as_deref())?;

    if args.format == OutputFormat::Json {
        return print_json(&versions);
    }
    if versions.is_empty() {
        println!("No history for {}", args.server);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Username").add_attribute(Attribute::Bold),
        Cell::new("Version").add_attribute(Attribute::Bold),
        Cell::new("Created").add_attribute(Attribute::Bold),
        Cell::new("Current").add_attribute(Attribute::Bold),
    ]);
    for v in &versions {
        table.add_row(vec![
            v.principal.clone(),
            v.version_id.clone(),
            local_time(v.created_at),
            if v.current { "*".to_string() } else { String::new() },
        ]);
    }
    println!("{}", table);
    println!("\n{} versions.", versions.len());
    Ok(())
}
