use crate::cli::health::cancel_on_interrupt;
use crate::cli::secret::parse_server;
use crate::cli::{print_json, CliContext, OutputFormat};
use crate::models::provisioning::{Overall, ProvisioningResult, StepOutcome};
use anyhow::Result;
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, Table};

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("targets").required(true).args(["hosts", "all"])))]
pub struct ProvisionArgs {
    /// Hosts to provision for their registered admin principal
    #[arg(value_parser = parse_server)]
    pub hosts: Vec<String>,

    /// Provision every registered server
    #[arg(long)]
    pub all: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

fn outcome_cell(outcome: &StepOutcome) -> Cell {
    let text = match outcome.detail() {
        Some(detail) => format!("{}: {}", outcome.label(), detail),
        None => outcome.label().to_string(),
    };
    let cell = Cell::new(text);
    match outcome {
        StepOutcome::Applied => cell.fg(Color::Green),
        StepOutcome::Failed(_) => cell.fg(Color::Red),
        StepOutcome::Skipped(_) => cell.fg(Color::Yellow),
        _ => cell,
    }
}

pub(crate) fn print_steps(result: &ProvisioningResult) {
    println!(
        "{} ({}): {}, reached {}",
        result.server, result.principal, result.overall, result.reached
    );
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        Cell::new("Step").add_attribute(Attribute::Bold),
        Cell::new("Outcome").add_attribute(Attribute::Bold),
        Cell::new("Attempts").add_attribute(Attribute::Bold),
    ]);
    for step in &result.steps {
        table.add_row(vec![
            Cell::new(&step.step),
            outcome_cell(&step.outcome),
            Cell::new(step.attempts),
        ]);
    }
    println!("{}", table);
    if result.overall == Overall::Failure && !result.changed() {
        println!("No changes were made; safe to retry.");
    }
}

pub async fn run(ctx: &CliContext, args: ProvisionArgs) -> Result<()> {
    let prompt = if args.all {
        "Provision every registered server?".to_string()
    } else {
        format!("Provision {}?", args.hosts.join(", "))
    };
    if !ctx.confirm(&prompt, args.yes)? {
        println!("Aborted.");
        return Ok(());
    }

    let manager = ctx.manager()?;
    cancel_on_interrupt(manager.cancellation_token());
    let hosts: &[String] = if args.all { &[] } else { &args.hosts };
    let outcome = manager.provision(&ctx.auth, hosts).await?;

    let failures = outcome
        .results
        .values()
        .filter(|r| r.overall == Overall::Failure)
        .count();

    if args.format == OutputFormat::Json {
        print_json(&outcome)?;
    } else {
        for result in outcome.results.values() {
            print_steps(result);
            println!();
        }
        println!(
            "{} provisioned, {} failed.",
            outcome.results.len() - failures,
            failures
        );
        if !outcome.is_complete() {
            println!("Not started: {}", outcome.not_started.join(", "));
        }
    }

    if failures > 0 || !outcome.is_complete() {
        std::process::exit(1);
    }
    Ok(())
}
