//! Webhooks command - print the telephony webhook endpoints

use anyhow::Result;
use clap::Args;

use crate::error::LaunchError;
use crate::launcher::Launcher;
use crate::webhooks::{derive_endpoints, resolve_api_prefix};

const BASE_URL_KEY: &str = "WEBHOOK_BASE_URL";

#[derive(Args, Debug)]
pub struct WebhooksArgs {
    /// Public base URL (defaults to WEBHOOK_BASE_URL from the env file)
    #[arg(long)]
    pub url: Option<String>,

    /// Output machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(launcher: &Launcher, args: WebhooksArgs) -> Result<()> {
    let env_file = launcher.env_file();
    let public_url = match args.url {
        Some(url) => url,
        None => match env_file.get(BASE_URL_KEY).map_err(LaunchError::from)? {
            Some(url) => url,
            None => anyhow::bail!(
                "No public URL: pass --url or run `zeipoctl voice` to set {} in {}",
                BASE_URL_KEY,
                env_file.path().display()
            ),
        },
    };

    let prefix = resolve_api_prefix(&env_file).map_err(LaunchError::from)?;
    let urls = derive_endpoints(&public_url, &prefix);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&urls)?);
        return Ok(());
    }

    println!("Voice:  {}", urls.voice);
    println!("Events: {}", urls.events);
    println!("DTMF:   {}", urls.dtmf);
    Ok(())
}
