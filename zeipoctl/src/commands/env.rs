//! Env command - read and write keys in the env file

use anyhow::Result;
use clap::Subcommand;
use env_file::Upsert;

use crate::error::LaunchError;
use crate::launcher::Launcher;
use crate::output;

#[derive(Subcommand, Debug)]
pub enum EnvCommand {
    /// Set KEY to VALUE, replacing the existing line or appending one
    Set {
        #[arg(value_name = "KEY")]
        key: String,
        #[arg(value_name = "VALUE", allow_hyphen_values = true)]
        value: String,
    },
    /// Print the value of KEY
    Get {
        #[arg(value_name = "KEY")]
        key: String,
    },
}

pub fn run(launcher: &Launcher, cmd: EnvCommand) -> Result<()> {
    let env_file = launcher.env_file();
    match cmd {
        EnvCommand::Set { key, value } => {
            let outcome = env_file.upsert(&key, &value).map_err(LaunchError::from)?;
            let verb = match outcome {
                Upsert::Replaced => "Updated",
                Upsert::Appended => "Added",
            };
            output::success(format!("{} {} in {}", verb, key, env_file.path().display()));
        }
        EnvCommand::Get { key } => match env_file.get(&key).map_err(LaunchError::from)? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("{} is not set in {}", key, env_file.path().display()),
        },
    }
    Ok(())
}
