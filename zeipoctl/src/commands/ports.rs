//! Ports command - release the API port in both environments

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use owo_colors::OwoColorize;
use std::time::Duration;
use tabled::{settings::style::Style, Table, Tabled};

use crate::launcher::Launcher;
use crate::output;
use crate::ports::{PortState, ReconciliationReport};

#[derive(Subcommand, Debug)]
pub enum PortsCommand {
    /// Terminate every listener on the port, then report whether it is free
    Release(ReleaseArgs),
}

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// How long to wait before re-scanning, e.g. "2s"
    #[arg(long, value_parser = parse_wait)]
    pub wait: Option<Duration>,

    /// Output machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Tabled)]
struct OutcomeRow {
    #[tabled(rename = "ENVIRONMENT")]
    environment: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "KILLED")]
    killed: String,
    #[tabled(rename = "REMAINING")]
    remaining: String,
}

fn parse_wait(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

pub fn run(launcher: &Launcher, cmd: PortsCommand) -> Result<()> {
    match cmd {
        PortsCommand::Release(args) => release(launcher, args),
    }
}

fn release(launcher: &Launcher, args: ReleaseArgs) -> Result<()> {
    let port = launcher.settings.api.port;
    let wait = args.wait.unwrap_or(launcher.settings.api.release_wait);

    if !args.json {
        output::step(format!("Releasing port {}", port));
    }
    let environments: [&dyn crate::environment::Environment; 2] =
        [launcher.host.as_ref(), launcher.sandbox.as_ref()];
    let report = launcher.reconciler().release_port(&environments, port, wait);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
        return Ok(());
    }

    print_report(&report);
    Ok(())
}

fn print_report(report: &ReconciliationReport) {
    let color = output::should_use_color();
    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|o| {
            let (state, remaining) = match &o.state {
                PortState::Free => ("free".to_string(), String::new()),
                PortState::StillOccupied { owners } => {
                    ("occupied".to_string(), super::describe_owners(owners))
                }
                PortState::Unknown { reason } => ("unknown".to_string(), reason.clone()),
            };
            let state = match (&o.state, color) {
                (_, false) => state,
                (PortState::Free, true) => state.green().to_string(),
                (PortState::StillOccupied { .. }, true) => state.red().to_string(),
                (PortState::Unknown { .. }, true) => state.yellow().to_string(),
            };
            OutcomeRow {
                environment: o.environment.to_string(),
                state,
                killed: o
                    .killed
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                remaining,
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);

    if report.is_free_everywhere() {
        output::success(format!("Port {} is free", report.port));
    } else {
        super::warn_unreleased(report);
    }
}
