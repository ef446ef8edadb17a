use crate::cli::secret::parse_server;
use crate::cli::{print_json, CliContext, OutputFormat};
use crate::models::health::{CheckKind, CheckResult, CheckStatus, HealthReport, HostStatus};
use anyhow::Result;
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, Table};
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Hosts to probe (default: every registered server)
    #[arg(value_parser = parse_server)]
    pub hosts: Vec<String>,

    /// Only re-check hosts not last seen online (explicit hosts are always probed)
    #[arg(long)]
    pub targeted: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Exit 1 when any probed host is offline
    #[arg(long)]
    pub fail_on_offline: bool,
}

/// Ctrl-C stops new hosts from starting; in-flight probes run to completion.
pub(crate) fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: no new hosts will be started");
            token.cancel();
        }
    });
}

fn check_cell(check: Option<&CheckResult>) -> Cell {
    match check {
        Some(c) => match c.status {
            CheckStatus::Passed => Cell::new(&c.detail).fg(Color::Green),
            CheckStatus::Failed => Cell::new(format!("FAIL: {}", c.detail)).fg(Color::Red),
            CheckStatus::Skipped => Cell::new("skipped"),
        },
        None => Cell::new("-"),
    }
}

fn status_cell(status: HostStatus) -> Cell {
    let color = match status {
        HostStatus::Online => Color::Green,
        HostStatus::Degraded => Color::Yellow,
        HostStatus::Offline => Color::Red,
    };
    Cell::new(status.to_string()).fg(color)
}

pub(crate) fn print_reports<'a>(reports: impl IntoIterator<Item = &'a HealthReport>) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    let mut header = vec![
        Cell::new("Host").add_attribute(Attribute::Bold),
        Cell::new("Status").add_attribute(Attribute::Bold),
    ];
    header.extend(
        CheckKind::ORDER
            .iter()
            .map(|k| Cell::new(k.name()).add_attribute(Attribute::Bold)),
    );
    table.set_header(header);

    for report in reports {
        let mut row = vec![Cell::new(report.server()), status_cell(report.status())];
        row.extend(CheckKind::ORDER.iter().map(|k| check_cell(report.check(*k))));
        table.add_row(row);
    }
    println!("{}", table);
}

pub async fn run(ctx: &CliContext, args: HealthArgs) -> Result<()> {
    let manager = ctx.manager()?;
    cancel_on_interrupt(manager.cancellation_token());

    let outcome = manager.health(&ctx.auth, &args.hosts, args.targeted).await?;
    let offline = outcome
        .results
        .values()
        .filter(|r| r.status() == HostStatus::Offline)
        .count();

    if args.format == OutputFormat::Json {
        print_json(&outcome)?;
    } else if outcome.results.is_empty() && outcome.not_started.is_empty() {
        if args.targeted {
            println!("All hosts online; nothing to re-check");
        } else {
            println!("No servers registered");
        }
    } else {
        print_reports(outcome.results.values());
        let degraded = outcome
            .results
            .values()
            .filter(|r| r.status() == HostStatus::Degraded)
            .count();
        println!(
            "\n{} online, {} degraded, {} offline.",
            outcome.results.len() - degraded - offline,
            degraded,
            offline
        );
        if !outcome.is_complete() {
            println!("Not started: {}", outcome.not_started.join(", "));
        }
    }

    if args.fail_on_offline && offline > 0 {
        std::process::exit(1);
    }
    Ok(())
}
