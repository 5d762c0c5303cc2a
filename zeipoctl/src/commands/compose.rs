//! Pass-through commands that run `docker compose` in the sandbox

use anyhow::Result;
use tracing::info;

use crate::compose::{compose_script, ComposeAction};
use crate::launcher::Launcher;
use crate::output;

pub fn run(launcher: &Launcher, action: ComposeAction) -> Result<()> {
    if action.binds_api_port() {
        let port = launcher.settings.api.port;
        output::step(format!("Releasing port {}", port));
        let report = launcher.release_port(port);
        super::warn_unreleased(&report);
    }

    let script = compose_script(&launcher.settings.compose, &action);
    info!(%script, "running compose");
    let status = launcher.sandbox.run_interactive(&script)?;
    if status != 0 {
        anyhow::bail!("docker compose exited with status {}", status);
    }
    Ok(())
}
