//! `docker compose` invocations run inside the sandbox.

use crate::environment::shell_quote;
use crate::settings::ComposeSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeAction {
    /// Service in the foreground, attached to the terminal.
    Api,
    Build,
    /// Whole stack, detached.
    Start,
    /// One service, detached.
    StartService,
    Stop,
    Logs { args: Vec<String> },
    Bash,
    Python { args: Vec<String> },
    /// Stack with the `gpu` profile enabled, detached.
    Gpu,
    Test { args: Vec<String> },
}

impl ComposeAction {
    /// Whether the API port should be released before this runs.
    pub fn binds_api_port(&self) -> bool {
        matches!(
            self,
            ComposeAction::Api | ComposeAction::Start | ComposeAction::StartService | ComposeAction::Gpu
        )
    }
}

/// Shell script for `action`, prefixed with a `cd` into the project
/// directory when one is configured.
pub fn compose_script(settings: &ComposeSettings, action: &ComposeAction) -> String {
    let service = shell_quote(&settings.service);
    let mut parts = vec![
        "docker".to_string(),
        "compose".to_string(),
        "-f".to_string(),
        shell_quote(&settings.file),
    ];

    match action {
        ComposeAction::Api => parts.extend(["up".to_string(), service]),
        ComposeAction::Build => parts.push("build".to_string()),
        ComposeAction::Start => parts.extend(["up".to_string(), "-d".to_string()]),
        ComposeAction::StartService => {
            parts.extend(["up".to_string(), "-d".to_string(), service])
        }
        ComposeAction::Stop => parts.push("down".to_string()),
        ComposeAction::Logs { args } => {
            parts.extend(["logs".to_string(), "-f".to_string()]);
            if args.is_empty() {
                parts.push(service);
            } else {
                parts.extend(args.iter().map(|a| shell_quote(a)));
            }
        }
        ComposeAction::Bash => {
            parts.extend(["exec".to_string(), service, "bash".to_string()])
        }
        ComposeAction::Python { args } => {
            parts.extend(["exec".to_string(), service, "python".to_string()]);
            parts.extend(args.iter().map(|a| shell_quote(a)));
        }
        ComposeAction::Gpu => parts.extend([
            "--profile".to_string(),
            "gpu".to_string(),
            "up".to_string(),
            "-d".to_string(),
        ]),
        ComposeAction::Test { args } => {
            parts.extend([
                "run".to_string(),
                "--rm".to_string(),
                service,
                "pytest".to_string(),
            ]);
            parts.extend(args.iter().map(|a| shell_quote(a)));
        }
    }

    let command = parts.join(" ");
    match &settings.project_dir {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
        None => command,
    }
}
