//! Doctor command - readiness check with optional forced runtime restart

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::error::LaunchError;
use crate::launcher::Launcher;
use crate::output;
use crate::readiness::{EnvironmentSession, RuntimeStatus};

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Restart the container runtime even if it looks healthy
    #[arg(long)]
    pub force: bool,

    /// Output machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    session: EnvironmentSession,
    runtime: RuntimeStatus,
    tunnel_cli: Option<String>,
}

/// `ensure_ready` only returns once the runtime answered as up, so the
/// report does not query it again.
fn collect(launcher: &Launcher, force: bool) -> Result<DoctorReport, LaunchError> {
    let session = launcher.prober().ensure_ready(force)?;
    let tunnel_cli = launcher.tunnels().ensure_cli().ok();

    Ok(DoctorReport {
        session,
        runtime: RuntimeStatus::Up,
        tunnel_cli,
    })
}

pub fn run(launcher: &Launcher, args: DoctorArgs) -> Result<()> {
    if !args.json {
        output::step("Checking sandbox and container runtime");
    }
    let report = collect(launcher, args.force)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.session.restarts > 0 {
        output::success(format!(
            "Container runtime recovered after {} restart(s)",
            report.session.restarts
        ));
    } else {
        output::success("Sandbox and container runtime are ready");
    }
    match &report.tunnel_cli {
        Some(version) => output::success(format!("Tunnel CLI: {}", version)),
        None => output::warn(format!(
            "Tunnel CLI '{}' not found; `voice` without --local will fail",
            launcher.settings.tunnel.binary
        )),
    }
    Ok(())
}
