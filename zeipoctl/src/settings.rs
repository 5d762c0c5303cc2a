use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SETTINGS_FILE: &str = "zeipo.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub compose: ComposeSettings,
    #[serde(rename = "envFile", default = "default_env_file")]
    pub env_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// WSL on Windows hosts, a plain shell everywhere else.
    Auto,
    Wsl,
    Direct,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_bridge")]
    pub bridge: BridgeMode,
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSettings {
    #[serde(rename = "processNames", default = "default_runtime_process_names")]
    pub process_names: Vec<String>,
    #[serde(rename = "startCommand", default = "default_start_command")]
    pub start_command: String,
    #[serde(rename = "restartAttempts", default = "default_restart_attempts")]
    pub restart_attempts: u32,
    #[serde(deserialize_with = "human_duration", default = "default_settle")]
    pub settle: Duration,
    #[serde(rename = "settleProbes", default = "default_settle_probes")]
    pub settle_probes: u32,
    #[serde(
        rename = "forceRestartDelay",
        deserialize_with = "human_duration",
        default = "default_force_restart_delay"
    )]
    pub force_restart_delay: Duration,
    #[serde(
        rename = "probeTimeout",
        deserialize_with = "human_duration",
        default = "default_probe_timeout"
    )]
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(
        rename = "releaseWait",
        deserialize_with = "human_duration",
        default = "default_release_wait"
    )]
    pub release_wait: Duration,
    #[serde(rename = "servicePatterns", default = "default_service_patterns")]
    pub service_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSettings {
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    #[serde(rename = "logPath", default = "default_tunnel_log_path")]
    pub log_path: PathBuf,
    #[serde(
        rename = "warmUp",
        deserialize_with = "human_duration",
        default = "default_warm_up"
    )]
    pub warm_up: Duration,
    #[serde(
        rename = "pollInterval",
        deserialize_with = "human_duration",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
    #[serde(rename = "pollAttempts", default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(
        rename = "stopGrace",
        deserialize_with = "human_duration",
        default = "default_stop_grace"
    )]
    pub stop_grace: Duration,
    #[serde(rename = "tailBytes", default = "default_tail_bytes")]
    pub tail_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeSettings {
    #[serde(default = "default_compose_file")]
    pub file: String,
    #[serde(default = "default_compose_service")]
    pub service: String,
    #[serde(rename = "projectDir", default)]
    pub project_dir: Option<String>,
}

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

// Default value functions
fn default_env_file() -> PathBuf {
    PathBuf::from(".env")
}

fn default_bridge() -> BridgeMode {
    BridgeMode::Auto
}

fn default_sentinel() -> String {
    "zeipo-ready".to_string()
}

fn default_runtime_process_names() -> Vec<String> {
    vec!["dockerd".to_string(), "containerd".to_string()]
}

fn default_start_command() -> String {
    "(nohup dockerd > /tmp/dockerd.log 2>&1 &)".to_string()
}

fn default_restart_attempts() -> u32 {
    2
}

fn default_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_probes() -> u32 {
    1
}

fn default_force_restart_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_api_port() -> u16 {
    8000
}

fn default_api_host() -> String {
    "localhost".to_string()
}

fn default_release_wait() -> Duration {
    Duration::from_secs(2)
}

fn default_service_patterns() -> Vec<String> {
    vec![
        "uvicorn".to_string(),
        "main:app".to_string(),
        "start_voip.py".to_string(),
    ]
}

fn default_tunnel_binary() -> String {
    "cloudflared".to_string()
}

fn default_tunnel_log_path() -> PathBuf {
    std::env::temp_dir().join("zeipo-tunnel.log")
}

fn default_warm_up() -> Duration {
    Duration::from_secs(3)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_tail_bytes() -> u64 {
    64 * 1024
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

fn default_compose_service() -> String {
    "api".to_string()
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            distro: None,
            sentinel: default_sentinel(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            process_names: default_runtime_process_names(),
            start_command: default_start_command(),
            restart_attempts: default_restart_attempts(),
            settle: default_settle(),
            settle_probes: default_settle_probes(),
            force_restart_delay: default_force_restart_delay(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            host: default_api_host(),
            release_wait: default_release_wait(),
            service_patterns: default_service_patterns(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            binary: default_tunnel_binary(),
            log_path: default_tunnel_log_path(),
            warm_up: default_warm_up(),
            poll_interval: default_poll_interval(),
            poll_attempts: default_poll_attempts(),
            stop_grace: default_stop_grace(),
            tail_bytes: default_tail_bytes(),
        }
    }
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            file: default_compose_file(),
            service: default_compose_service(),
            project_dir: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sandbox: SandboxSettings::default(),
            runtime: RuntimeSettings::default(),
            api: ApiSettings::default(),
            tunnel: TunnelSettings::default(),
            compose: ComposeSettings::default(),
            env_file: default_env_file(),
        }
    }
}

/// Command-line values that take precedence over the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub distro: Option<String>,
    pub env_file: Option<PathBuf>,
}

impl Settings {
    /// Loads `path` when given (it must exist), otherwise `zeipo.yaml` in the
    /// working directory if present, otherwise built-in defaults.
    ///
    /// Not validated: call [`Settings::validate`] once overrides are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_SETTINGS_FILE);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    debug!("no settings file found, using defaults");
                    Self::default()
                }
            }
        };
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings = serde_yaml::from_str(content)?;
        Ok(settings)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(port) = overrides.port {
            self.api.port = port;
        }
        if let Some(distro) = overrides.distro {
            self.sandbox.distro = Some(distro);
        }
        if let Some(env_file) = overrides.env_file {
            self.env_file = env_file;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.port == 0 {
            anyhow::bail!("api.port must be a non-zero TCP port");
        }
        if self.sandbox.sentinel.trim().is_empty() {
            anyhow::bail!("sandbox.sentinel cannot be empty");
        }
        if self.runtime.restart_attempts == 0 {
            anyhow::bail!("runtime.restartAttempts must be at least 1");
        }
        if self.runtime.settle_probes == 0 {
            anyhow::bail!("runtime.settleProbes must be at least 1");
        }
        if self.tunnel.binary.trim().is_empty() {
            anyhow::bail!("tunnel.binary cannot be empty");
        }
        if self.tunnel.poll_attempts == 0 {
            anyhow::bail!("tunnel.pollAttempts must be at least 1");
        }
        if self.compose.service.trim().is_empty() {
            anyhow::bail!("compose.service cannot be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_empty_yaml_when_parsed_then_defaults_apply() {
        let settings = Settings::from_yaml("").unwrap();

        assert_eq!(settings.api.port, 8000);
        assert_eq!(settings.runtime.restart_attempts, 2);
        assert_eq!(settings.tunnel.poll_attempts, 10);
        assert_eq!(settings.tunnel.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.env_file, PathBuf::from(".env"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn given_partial_yaml_when_parsed_then_human_durations_and_defaults_mix() {
        let yaml = r#"
sandbox:
  bridge: wsl
  distro: Ubuntu-22.04
runtime:
  settle: 750ms
  restartAttempts: 3
tunnel:
  warmUp: 5s
  pollAttempts: 20
compose:
  projectDir: /home/dev/zeipo
"#;
        let settings = Settings::from_yaml(yaml).unwrap();

        assert_eq!(settings.sandbox.bridge, BridgeMode::Wsl);
        assert_eq!(settings.sandbox.distro.as_deref(), Some("Ubuntu-22.04"));
        assert_eq!(settings.runtime.settle, Duration::from_millis(750));
        assert_eq!(settings.runtime.restart_attempts, 3);
        assert_eq!(settings.runtime.force_restart_delay, Duration::from_secs(2));
        assert_eq!(settings.tunnel.warm_up, Duration::from_secs(5));
        assert_eq!(settings.tunnel.poll_attempts, 20);
        assert_eq!(settings.compose.project_dir.as_deref(), Some("/home/dev/zeipo"));
        assert_eq!(settings.compose.service, "api");
    }

    #[test]
    fn given_bad_duration_when_parsed_then_error() {
        assert!(Settings::from_yaml("runtime:\n  settle: soon\n").is_err());
    }

    #[test]
    fn given_zero_attempts_when_validated_then_rejected() {
        let mut settings = Settings::default();
        settings.tunnel.poll_attempts = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("pollAttempts"));
    }

    #[test]
    fn given_overrides_when_applied_then_take_precedence() {
        let settings = Settings::default().apply(Overrides {
            port: Some(9000),
            distro: Some("Debian".to_string()),
            env_file: Some(PathBuf::from("config/.env")),
        });

        assert_eq!(settings.api.port, 9000);
        assert_eq!(settings.sandbox.distro.as_deref(), Some("Debian"));
        assert_eq!(settings.env_file, PathBuf::from("config/.env"));
    }

    #[test]
    fn given_missing_explicit_file_when_loading_then_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/zeipo.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read settings file"));
    }

    #[test]
    fn given_zero_port_in_file_when_cli_port_applied_then_valid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("zeipo.yaml");
        std::fs::write(&path, "api:\n  port: 0\n").unwrap();

        let loaded = Settings::load(Some(&path)).unwrap();
        assert!(loaded.validate().is_err());

        let settings = loaded.apply(Overrides {
            port: Some(9000),
            ..Overrides::default()
        });
        assert_eq!(settings.api.port, 9000);
        assert!(settings.validate().is_ok());
    }
}
