//! Quick-tunnel lifecycle: one tunnel process at a time, public URL
//! discovered by tailing the tunnel's log file.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::environment::Environment;
use crate::error::LaunchError;
use crate::poll::Poller;
use crate::settings::TunnelSettings;

static PUBLIC_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https://[a-z0-9-]+(?:\.[a-z0-9-]+)*\.trycloudflare\.com")
        .expect("valid tunnel url regex")
});

/// First provider-assigned URL in `text`. The provider's own API host is
/// not a tunnel URL and is skipped.
pub fn extract_public_url(text: &str) -> Option<String> {
    PUBLIC_URL
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|url| !url.eq_ignore_ascii_case("https://api.trycloudflare.com"))
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Starting,
    UrlDiscovered,
    Failed,
}

/// A running tunnel process owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelHandle {
    pub pid: u32,
    pub local_port: Option<u16>,
    pub log_path: PathBuf,
    pub public_url: Option<String>,
    pub state: TunnelState,
}

/// Where the tunnel process writes and the poller reads.
pub trait TunnelLog {
    fn path(&self) -> &Path;
    /// Empties the log so a stale URL from an earlier tunnel cannot match.
    fn reset(&self) -> Result<()>;
    fn read_tail(&self) -> Result<String>;
}

pub struct FileTunnelLog {
    path: PathBuf,
    tail_bytes: u64,
}

impl FileTunnelLog {
    pub fn new(path: impl Into<PathBuf>, tail_bytes: u64) -> Self {
        Self {
            path: path.into(),
            tail_bytes,
        }
    }
}

impl TunnelLog for FileTunnelLog {
    fn path(&self) -> &Path {
        &self.path
    }

    fn reset(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("Failed to reset tunnel log '{}'", self.path.display()))?;
        Ok(())
    }

    fn read_tail(&self) -> Result<String> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open tunnel log '{}'", self.path.display()))?;
        let len = file.metadata()?.len();
        if len > self.tail_bytes {
            file.seek(SeekFrom::Start(len - self.tail_bytes))?;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

pub struct TunnelManager {
    host: Arc<dyn Environment>,
    log: Arc<dyn TunnelLog>,
    clock: Arc<dyn Clock>,
    settings: TunnelSettings,
}

impl TunnelManager {
    pub fn new(
        host: Arc<dyn Environment>,
        log: Arc<dyn TunnelLog>,
        clock: Arc<dyn Clock>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            host,
            log,
            clock,
            settings,
        }
    }

    /// Fails with `CloudflareCliMissing` unless `<binary> --version` succeeds.
    pub fn ensure_cli(&self) -> Result<String, LaunchError> {
        let missing = || LaunchError::CloudflareCliMissing {
            binary: self.settings.binary.clone(),
        };
        let output = self
            .host
            .execute(&self.settings.binary, &["--version"])
            .map_err(|_| missing())?;
        if !output.success() {
            return Err(missing());
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Tunnel processes already running on the host. When the log still
    /// holds a URL it is attached to the handle.
    pub fn find_running(&self) -> Result<Vec<TunnelHandle>, LaunchError> {
        let pids = self.host.find_processes(&self.settings.binary)?;
        if pids.is_empty() {
            return Ok(Vec::new());
        }

        let public_url = self
            .log
            .read_tail()
            .ok()
            .and_then(|text| extract_public_url(&text));

        Ok(pids
            .into_iter()
            .map(|pid| TunnelHandle {
                pid,
                local_port: None,
                log_path: self.log.path().to_path_buf(),
                public_url: public_url.clone(),
                state: if public_url.is_some() {
                    TunnelState::UrlDiscovered
                } else {
                    TunnelState::Starting
                },
            })
            .collect())
    }

    pub fn stop_tunnel(&self, handle: &TunnelHandle) -> Result<(), LaunchError> {
        info!(pid = handle.pid, "stopping tunnel");
        self.host.kill_process(handle.pid)?;
        Ok(())
    }

    /// Stops every handle in `prior`, launches a fresh tunnel to
    /// `localhost:<local_port>` and waits for its public URL.
    ///
    /// On `TunnelUrlNotFound` the new process is left running; the URL may
    /// still show up later.
    pub fn start_tunnel(
        &self,
        prior: Vec<TunnelHandle>,
        local_port: u16,
    ) -> Result<TunnelHandle, LaunchError> {
        if !prior.is_empty() {
            for handle in &prior {
                if let Err(err) = self.stop_tunnel(handle) {
                    warn!(pid = handle.pid, error = %err, "failed to stop previous tunnel");
                }
            }
            self.clock.sleep(self.settings.stop_grace);
        }

        self.log.reset()?;

        let target = format!("http://localhost:{}", local_port);
        let pid = self.host.spawn_detached(
            &self.settings.binary,
            &["tunnel", "--no-autoupdate", "--url", target.as_str()],
            self.log.path(),
        )?;
        info!(pid, %target, log = %self.log.path().display(), "tunnel process started");

        self.clock.sleep(self.settings.warm_up);

        let poller = Poller::new(self.settings.poll_interval, self.settings.poll_attempts);
        let discovered = poller.poll_until(
            self.clock.as_ref(),
            || self.log.read_tail(),
            |text| extract_public_url(text),
        );

        match discovered {
            Ok(url) => {
                debug!(%url, "tunnel url discovered");
                Ok(TunnelHandle {
                    pid,
                    local_port: Some(local_port),
                    log_path: self.log.path().to_path_buf(),
                    public_url: Some(url),
                    state: TunnelState::UrlDiscovered,
                })
            }
            Err(timeout) => {
                warn!(pid, attempts = timeout.attempts, "tunnel url not found, leaving process running");
                Err(LaunchError::TunnelUrlNotFound {
                    attempts: timeout.attempts,
                    log_path: self.log.path().display().to_string(),
                    pid,
                })
            }
        }
    }
}
