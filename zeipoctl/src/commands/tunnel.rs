//! Tunnel command - start, stop and inspect the quick tunnel

use anyhow::Result;
use clap::Subcommand;

use crate::launcher::Launcher;
use crate::output;

#[derive(Subcommand, Debug)]
pub enum TunnelCommand {
    /// Replace any running tunnel with a new one to the API port
    Start,
    /// Stop every running tunnel
    Stop,
    /// Show running tunnels
    Status {
        /// Output machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(launcher: &Launcher, cmd: TunnelCommand) -> Result<()> {
    let tunnels = launcher.tunnels();
    match cmd {
        TunnelCommand::Start => {
            tunnels.ensure_cli()?;
            let port = launcher.settings.api.port;
            let prior = tunnels.find_running()?;
            if !prior.is_empty() {
                output::step(format!("Stopping {} running tunnel(s)", prior.len()));
            }
            output::step(format!("Starting tunnel to localhost:{}", port));
            let handle = tunnels.start_tunnel(prior, port)?;
            output::success(format!(
                "Tunnel {} is up at {}",
                handle.pid,
                handle.public_url.unwrap_or_default()
            ));
        }
        TunnelCommand::Stop => {
            let running = tunnels.find_running()?;
            if running.is_empty() {
                output::success("No tunnel running");
                return Ok(());
            }
            for handle in &running {
                tunnels.stop_tunnel(handle)?;
                output::success(format!("Stopped tunnel {}", handle.pid));
            }
        }
        TunnelCommand::Status { json } => {
            let running = tunnels.find_running()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&running)?);
                return Ok(());
            }
            if running.is_empty() {
                println!("No tunnel running");
            }
            for handle in running {
                println!(
                    "{}\t{}",
                    handle.pid,
                    handle.public_url.as_deref().unwrap_or("(url not yet logged)")
                );
            }
        }
    }
    Ok(())
}
