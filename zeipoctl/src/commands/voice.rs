//! Voice command - expose the API and point the telephony webhooks at it

use anyhow::Result;
use clap::Args;

use crate::launcher::Launcher;
use crate::output::{self, Tone};
use crate::voice::{VoiceEndpoints, VoiceOptions, VoiceWorkflow, DEFAULT_PROVIDER};

#[derive(Args, Debug)]
pub struct VoiceArgs {
    /// Default telephony provider written to the env file
    #[arg(long, default_value = DEFAULT_PROVIDER)]
    pub provider: String,

    /// Skip the tunnel and use the local VoIP simulator
    #[arg(long)]
    pub local: bool,
}

pub fn run(launcher: &Launcher, args: VoiceArgs) -> Result<()> {
    let options = VoiceOptions {
        provider: args.provider,
        local: args.local,
    };

    let outcome = VoiceWorkflow::new(launcher).run(&options, &mut |tone, line| match tone {
        Tone::Step => output::step(line),
        Tone::Success => output::success(line),
        Tone::Warning => output::warn(line),
        Tone::Failure => output::failure(line),
    })?;

    match &outcome.endpoints {
        VoiceEndpoints::Tunnel { webhooks, .. } => {
            output::success(format!("Voice webhook:  {}", webhooks.voice));
            output::success(format!("Events webhook: {}", webhooks.events));
            output::success(format!("DTMF webhook:   {}", webhooks.dtmf));
        }
        VoiceEndpoints::Local { base_url, ws_url } => {
            output::success(format!("API:       {}", base_url));
            output::success(format!("WebSocket: {}", ws_url));
        }
    }
    output::success(format!(
        "Updated {} in {}",
        outcome.updated_keys.join(", "),
        launcher.settings.env_file.display()
    ));
    Ok(())
}
