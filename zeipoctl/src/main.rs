use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use zeipoctl::clock::SystemClock;
use zeipoctl::commands::{
    self, doctor::DoctorArgs, env::EnvCommand, ports::PortsCommand, tunnel::TunnelCommand,
    voice::VoiceArgs, webhooks::WebhooksArgs,
};
use zeipoctl::compose::ComposeAction;
use zeipoctl::environment::HostPlatform;
use zeipoctl::exec::SystemCommandExecutor;
use zeipoctl::launcher::Launcher;
use zeipoctl::output;
use zeipoctl::settings::{Overrides, Settings};
use zeipoctl::LaunchError;

#[derive(Parser)]
#[command(name = "zeipoctl", version, about = "Launcher for the Zeipo voice stack")]
struct Cli {
    /// Settings file (defaults to ./zeipo.yaml when present)
    #[arg(long, global = true, env = "ZEIPO_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Env file holding the API configuration
    #[arg(long, global = true, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// API port, also the port `ports release` and `tunnel start` act on
    #[arg(long, global = true, env = "ZEIPO_API_PORT")]
    port: Option<u16>,

    /// WSL distribution hosting the sandbox
    #[arg(long, global = true, env = "ZEIPO_WSL_DISTRO")]
    distro: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and exit
    Version,
    /// Check the sandbox and container runtime, repairing the runtime if needed
    Doctor(DoctorArgs),
    /// Port reconciliation
    #[command(subcommand)]
    Ports(PortsCommand),
    /// Quick tunnel lifecycle
    #[command(subcommand)]
    Tunnel(TunnelCommand),
    /// Read and write the env file
    #[command(subcommand)]
    Env(EnvCommand),
    /// Print the telephony webhook URLs
    Webhooks(WebhooksArgs),
    /// Expose the API and configure the telephony webhooks
    Voice(VoiceArgs),
    /// Run the API service in the foreground
    Api,
    /// Build the service images
    Build,
    /// Start the stack in the background
    Start,
    /// Stop the stack
    Stop,
    /// Follow service logs
    Logs {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Open a shell in the API container
    Bash,
    /// Run python in the API container
    Python {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Start the stack with the GPU profile
    Gpu,
    /// Run the test suite in a fresh API container
    Test {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Commands {
    /// Commands that never touch the sandbox skip the readiness probe.
    /// `doctor` runs the probe itself.
    fn requires_readiness(&self) -> bool {
        !matches!(
            self,
            Commands::Version | Commands::Env(_) | Commands::Webhooks(_) | Commands::Doctor(_)
        )
    }
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        let code = err
            .downcast_ref::<LaunchError>()
            .map(LaunchError::exit_code)
            .unwrap_or(1);
        output::failure(format!("{:#}", err));
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Version = cli.cmd {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::load(cli.config.as_deref())?.apply(Overrides {
        port: cli.port,
        distro: cli.distro,
        env_file: cli.env_file,
    });
    settings.validate()?;

    let launcher = Launcher::new(
        settings,
        Arc::new(SystemCommandExecutor),
        Arc::new(SystemClock),
        HostPlatform::current(),
    );

    if cli.cmd.requires_readiness() {
        let session = launcher.prober().ensure_ready(false)?;
        tracing::debug!(restarts = session.restarts, "sandbox ready");
    }

    match cli.cmd {
        Commands::Version => Ok(()),
        Commands::Doctor(args) => commands::doctor::run(&launcher, args),
        Commands::Ports(cmd) => commands::ports::run(&launcher, cmd),
        Commands::Tunnel(cmd) => commands::tunnel::run(&launcher, cmd),
        Commands::Env(cmd) => commands::env::run(&launcher, cmd),
        Commands::Webhooks(args) => commands::webhooks::run(&launcher, args),
        Commands::Voice(args) => commands::voice::run(&launcher, args),
        Commands::Api => commands::compose::run(&launcher, ComposeAction::Api),
        Commands::Build => commands::compose::run(&launcher, ComposeAction::Build),
        Commands::Start => commands::compose::run(&launcher, ComposeAction::Start),
        Commands::Stop => commands::compose::run(&launcher, ComposeAction::Stop),
        Commands::Logs { args } => commands::compose::run(&launcher, ComposeAction::Logs { args }),
        Commands::Bash => commands::compose::run(&launcher, ComposeAction::Bash),
        Commands::Python { args } => {
            commands::compose::run(&launcher, ComposeAction::Python { args })
        }
        Commands::Gpu => commands::compose::run(&launcher, ComposeAction::Gpu),
        Commands::Test { args } => commands::compose::run(&launcher, ComposeAction::Test { args }),
    }
}
