//! The `voice` workflow: free the API port, expose it (or not, in local
//! mode), write the resulting addresses into the env file and start the
//! API service.

use serde::Serialize;
use tracing::info;

use crate::compose::{compose_script, ComposeAction};
use crate::error::LaunchError;
use crate::launcher::Launcher;
use crate::output::Tone;
use crate::ports::{PortState, ReconciliationReport};
use crate::tunnel::TunnelHandle;
use crate::webhooks::{derive_endpoints, resolve_api_prefix, WebhookUrls};

pub const DEFAULT_PROVIDER: &str = "at";
pub const LOCAL_PROVIDER: &str = "voip_simulator";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceOptions {
    pub provider: String,
    pub local: bool,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            local: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VoiceEndpoints {
    Tunnel {
        tunnel: TunnelHandle,
        webhooks: WebhookUrls,
    },
    Local {
        base_url: String,
        ws_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceOutcome {
    pub provider: String,
    pub endpoints: VoiceEndpoints,
    pub ports: ReconciliationReport,
    /// Env file keys written, in order.
    pub updated_keys: Vec<String>,
}

pub struct VoiceWorkflow<'a> {
    launcher: &'a Launcher,
}

impl<'a> VoiceWorkflow<'a> {
    pub fn new(launcher: &'a Launcher) -> Self {
        Self { launcher }
    }

    pub fn run(
        &self,
        options: &VoiceOptions,
        progress: &mut dyn FnMut(Tone, &str),
    ) -> Result<VoiceOutcome, LaunchError> {
        let tunnels = self.launcher.tunnels();
        if !options.local {
            let version = tunnels.ensure_cli()?;
            info!(%version, "tunnel cli available");
        }

        let env_file = self.launcher.env_file();
        if !env_file.exists() {
            return Err(LaunchError::ConfigFileMissing {
                path: env_file.path().display().to_string(),
            });
        }

        let port = self.launcher.settings.api.port;
        progress(Tone::Step, &format!("Releasing port {}", port));
        let ports = self.launcher.release_port(port);
        for outcome in &ports.outcomes {
            if let PortState::StillOccupied { owners } = &outcome.state {
                progress(
                    Tone::Warning,
                    &format!(
                        "Port {} still in use in {} by {} process(es); continuing",
                        port,
                        outcome.environment,
                        owners.len()
                    ),
                );
            }
        }

        let prefix = resolve_api_prefix(&env_file)?;
        let mut updated_keys = Vec::new();
        let mut set = |key: &str, value: &str| -> Result<(), LaunchError> {
            env_file.upsert(key, value)?;
            updated_keys.push(key.to_string());
            Ok(())
        };

        let (provider, endpoints) = if options.local {
            let host = &self.launcher.settings.api.host;
            let base_url = format!("http://{}:{}", host, port);
            let ws_url = format!("ws://{}:{}{}/ws", host, port, prefix);
            progress(Tone::Step, &format!("Configuring local mode at {}", base_url));

            set("BASE_URL", &base_url)?;
            set("WS_URL", &ws_url)?;
            set("TELEPHONY_PROVIDER", LOCAL_PROVIDER)?;
            set("DEFAULT_TELEPHONY_PROVIDER", LOCAL_PROVIDER)?;

            (
                LOCAL_PROVIDER.to_string(),
                VoiceEndpoints::Local { base_url, ws_url },
            )
        } else {
            let prior = tunnels.find_running()?;
            if !prior.is_empty() {
                progress(
                    Tone::Step,
                    &format!("Stopping {} running tunnel(s)", prior.len()),
                );
            }
            progress(Tone::Step, &format!("Starting tunnel to localhost:{}", port));
            let tunnel = tunnels.start_tunnel(prior, port)?;
            let public_url = tunnel.public_url.clone().unwrap_or_default();
            progress(Tone::Success, &format!("Tunnel URL: {}", public_url));

            let webhooks = derive_endpoints(&public_url, &prefix);
            set("WEBHOOK_URL", &public_url)?;
            set("WEBHOOK_BASE_URL", &public_url)?;
            set("BASE_URL", &public_url)?;
            set("DEFAULT_TELEPHONY_PROVIDER", &options.provider)?;

            (
                options.provider.clone(),
                VoiceEndpoints::Tunnel { tunnel, webhooks },
            )
        };

        progress(
            Tone::Step,
            &format!("Starting {} service", self.launcher.settings.compose.service),
        );
        let script = compose_script(&self.launcher.settings.compose, &ComposeAction::StartService);
        let status = self.launcher.sandbox.run_interactive(&script)?;
        if status != 0 {
            return Err(LaunchError::Command(anyhow::anyhow!(
                "docker compose exited with status {}",
                status
            )));
        }

        Ok(VoiceOutcome {
            provider,
            endpoints,
            ports,
            updated_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::environment::HostPlatform;
    use crate::exec::{CommandOutput, RecordingExecutor};
    use crate::settings::Settings;
    use crate::tunnel::TunnelLog;
    use anyhow::Result;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Tunnel log that survives resets and always shows a URL.
    struct AnnouncedLog;

    impl TunnelLog for AnnouncedLog {
        fn path(&self) -> &Path {
            Path::new("/tmp/zeipo-tunnel.log")
        }

        fn reset(&self) -> Result<()> {
            Ok(())
        }

        fn read_tail(&self) -> Result<String> {
            Ok("INF |  https://abc.trycloudflare.com  |\n".to_string())
        }
    }

    fn executor() -> RecordingExecutor {
        RecordingExecutor::new()
            .on("lsof", CommandOutput::failed(1, ""))
            .on("ss -ltnpH", CommandOutput::ok(""))
    }

    fn launcher(executor: Arc<RecordingExecutor>, env_path: PathBuf) -> Launcher {
        let mut settings = Settings::default();
        settings.env_file = env_path;
        Launcher::new(
            settings,
            executor,
            Arc::new(ManualClock::default()),
            HostPlatform::Unix,
        )
        .with_tunnel_log(Arc::new(AnnouncedLog))
    }

    #[test]
    fn given_tunnel_mode_when_run_then_webhook_keys_written_and_api_started() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "API_V1_STR=/api/v1\nWEBHOOK_URL=https://old.example\n").unwrap();
        let executor = Arc::new(executor());
        let launcher = launcher(executor.clone(), env_path.clone());

        let mut lines = Vec::new();
        let outcome = VoiceWorkflow::new(&launcher)
            .run(&VoiceOptions::default(), &mut |_, line| lines.push(line.to_string()))
            .unwrap();

        let content = std::fs::read_to_string(&env_path).unwrap();
        assert_eq!(
            content,
            "API_V1_STR=/api/v1\n\
             WEBHOOK_URL=https://abc.trycloudflare.com\n\
             WEBHOOK_BASE_URL=https://abc.trycloudflare.com\n\
             BASE_URL=https://abc.trycloudflare.com\n\
             DEFAULT_TELEPHONY_PROVIDER=at\n"
        );
        match outcome.endpoints {
            VoiceEndpoints::Tunnel { webhooks, .. } => {
                assert_eq!(webhooks.voice, "https://abc.trycloudflare.com/api/v1/at/voice")
            }
            other => panic!("unexpected endpoints: {other:?}"),
        }
        assert_eq!(executor.count_matching("cloudflared --version"), 1);
        assert_eq!(executor.count_matching("up -d 'api'"), 1);
        assert!(lines.iter().any(|l| l.contains("Tunnel URL")));
    }

    #[test]
    fn given_local_mode_when_run_then_no_tunnel_and_simulator_configured() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "API_V1_STR=/api/v1\n").unwrap();
        let executor = Arc::new(executor().forbid("cloudflared"));
        let launcher = launcher(executor.clone(), env_path.clone());

        let outcome = VoiceWorkflow::new(&launcher)
            .run(
                &VoiceOptions {
                    provider: "at".to_string(),
                    local: true,
                },
                &mut |_, _| {},
            )
            .unwrap();

        assert_eq!(outcome.provider, "voip_simulator");
        let content = std::fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("BASE_URL=http://localhost:8000\n"));
        assert!(content.contains("WS_URL=ws://localhost:8000/api/v1/ws\n"));
        assert!(content.contains("TELEPHONY_PROVIDER=voip_simulator\n"));
        assert!(content.contains("DEFAULT_TELEPHONY_PROVIDER=voip_simulator\n"));
    }

    #[test]
    fn given_missing_env_file_when_run_then_config_file_missing_before_any_kill() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(executor().forbid("kill").forbid("tunnel --no-autoupdate"));
        let launcher = launcher(executor, dir.path().join(".env"));

        let err = VoiceWorkflow::new(&launcher)
            .run(&VoiceOptions::default(), &mut |_, _| {})
            .unwrap_err();

        assert!(matches!(err, LaunchError::ConfigFileMissing { .. }));
    }

    #[test]
    fn given_compose_failure_when_run_then_command_error() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "").unwrap();
        let executor = Arc::new(executor().on("docker compose", CommandOutput::failed(1, "")));
        let launcher = launcher(executor, env_path);

        let err = VoiceWorkflow::new(&launcher)
            .run(
                &VoiceOptions {
                    provider: "at".to_string(),
                    local: true,
                },
                &mut |_, _| {},
            )
            .unwrap_err();

        assert!(matches!(err, LaunchError::Command(_)));
    }
}
