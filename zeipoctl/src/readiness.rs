//! Sandbox and container-runtime readiness with bounded self-healing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::environment::{shell_quote, Environment};
use crate::error::LaunchError;
use crate::poll::Poller;
use crate::settings::RuntimeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Up,
    /// The engine answers a status request but hangs or fails the deep check.
    Degraded,
    Down,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeStatus::Up => write!(f, "up"),
            RuntimeStatus::Degraded => write!(f, "degraded"),
            RuntimeStatus::Down => write!(f, "down"),
        }
    }
}

/// Snapshot of the sandbox runtime, re-derived on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSession {
    pub alive: bool,
    pub runtime_alive: bool,
    pub last_checked_at: DateTime<Utc>,
    pub restarts: u32,
}

impl EnvironmentSession {
    pub fn is_usable(&self) -> bool {
        self.alive && self.runtime_alive
    }
}

pub struct ReadinessProber {
    sandbox: Arc<dyn Environment>,
    clock: Arc<dyn Clock>,
    sentinel: String,
    runtime: RuntimeSettings,
}

impl ReadinessProber {
    pub fn new(
        sandbox: Arc<dyn Environment>,
        clock: Arc<dyn Clock>,
        sentinel: impl Into<String>,
        runtime: RuntimeSettings,
    ) -> Self {
        Self {
            sandbox,
            clock,
            sentinel: sentinel.into(),
            runtime,
        }
    }

    /// Verifies the sandbox answers and the container engine is responsive,
    /// restarting the engine a bounded number of times if it is not. The
    /// happy path issues no kill or start commands unless `force_restart`.
    pub fn ensure_ready(&self, force_restart: bool) -> Result<EnvironmentSession, LaunchError> {
        self.check_sandbox()?;

        if force_restart {
            info!("force restart requested, stopping container runtime");
            self.kill_runtime();
            self.clock.sleep(self.runtime.force_restart_delay);
        }

        let status = self.runtime_status();
        if status == RuntimeStatus::Up {
            return Ok(self.session(0));
        }

        warn!(%status, "container runtime not responsive, attempting restart");
        let settle = Poller::new(self.runtime.settle, self.runtime.settle_probes);
        let mut last_status = status;

        for attempt in 1..=self.runtime.restart_attempts {
            info!(attempt, max = self.runtime.restart_attempts, "restarting container runtime");
            self.kill_runtime();
            if let Err(err) = self.start_runtime() {
                warn!(attempt, error = %err, "runtime start command failed");
            }

            let outcome = settle.poll_until(
                self.clock.as_ref(),
                || Ok(self.runtime_status()),
                |status| {
                    last_status = *status;
                    (*status == RuntimeStatus::Up).then_some(())
                },
            );

            if outcome.is_ok() {
                info!(attempt, "container runtime is up");
                return Ok(self.session(attempt));
            }
        }

        Err(LaunchError::RuntimeStartFailed {
            attempts: self.runtime.restart_attempts,
            last_status,
        })
    }

    fn check_sandbox(&self) -> Result<(), LaunchError> {
        let script = format!("echo {}", shell_quote(&self.sentinel));
        let actual = match self.sandbox.run_shell(&script) {
            Ok(output) if output.success() => output.stdout.trim().to_string(),
            Ok(output) => output.stderr.trim().to_string(),
            Err(err) => err.to_string(),
        };

        if actual != self.sentinel {
            return Err(LaunchError::SandboxUnresponsive {
                expected: self.sentinel.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Basic status request first; when that passes, a time-bounded
    /// `docker info` catches an engine that exists but hangs.
    pub fn runtime_status(&self) -> RuntimeStatus {
        let basic = self
            .sandbox
            .run_shell("docker version --format '{{.Server.Version}}'");
        match basic {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {}
            _ => return RuntimeStatus::Down,
        }

        let deep = format!(
            "timeout {} docker info --format '{{{{.ServerVersion}}}}'",
            self.runtime.probe_timeout.as_secs().max(1)
        );
        match self.sandbox.run_shell(&deep) {
            Ok(output) if output.success() => RuntimeStatus::Up,
            _ => RuntimeStatus::Degraded,
        }
    }

    fn kill_runtime(&self) {
        let script = self
            .runtime
            .process_names
            .iter()
            .map(|name| format!("pkill -9 -x {}", shell_quote(name)))
            .collect::<Vec<_>>()
            .join("; ");
        if script.is_empty() {
            return;
        }
        if let Err(err) = self.sandbox.run_shell(&format!("{}; true", script)) {
            warn!(error = %err, "failed to stop runtime processes");
        }
    }

    fn start_runtime(&self) -> anyhow::Result<()> {
        let output = self.sandbox.run_shell(&self.runtime.start_command)?;
        if !output.success() {
            anyhow::bail!("{}", output.stderr.trim());
        }
        Ok(())
    }

    fn session(&self, restarts: u32) -> EnvironmentSession {
        EnvironmentSession {
            alive: true,
            runtime_alive: true,
            last_checked_at: self.clock.now(),
            restarts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::environment::{SandboxBridge, SandboxEnvironment};
    use crate::exec::{CommandOutput, RecordingExecutor};
    use std::time::Duration;

    fn prober(executor: Arc<RecordingExecutor>, clock: Arc<ManualClock>) -> ReadinessProber {
        let sandbox = Arc::new(SandboxEnvironment::new(executor, SandboxBridge::Direct));
        ReadinessProber::new(sandbox, clock, "zeipo-ready", RuntimeSettings::default())
    }

    fn healthy() -> RecordingExecutor {
        RecordingExecutor::new()
            .on("echo 'zeipo-ready'", CommandOutput::ok("zeipo-ready\n"))
            .on("docker version", CommandOutput::ok("24.0.7\n"))
            .on("docker info", CommandOutput::ok("24.0.7\n"))
    }

    #[cfg(unix)]
    #[test]
    fn given_sentinel_with_shell_metacharacters_when_checked_then_echoed_verbatim() {
        use crate::exec::SystemCommandExecutor;

        let sandbox = Arc::new(SandboxEnvironment::new(
            Arc::new(SystemCommandExecutor),
            SandboxBridge::Direct,
        ));
        let readiness = ReadinessProber::new(
            sandbox,
            Arc::new(ManualClock::default()),
            "zeipo ready; ok $HOME",
            RuntimeSettings::default(),
        );

        assert!(readiness.check_sandbox().is_ok());
    }

    #[test]
    fn given_healthy_sandbox_when_ensure_ready_then_no_mutation() {
        let executor = Arc::new(healthy().forbid("pkill").forbid("dockerd >"));
        let clock = Arc::new(ManualClock::default());

        let session = prober(executor.clone(), clock.clone())
            .ensure_ready(false)
            .unwrap();

        assert!(session.is_usable());
        assert_eq!(session.restarts, 0);
        assert!(clock.sleeps().is_empty());
        assert_eq!(executor.calls().len(), 3);
    }

    #[test]
    fn given_wrong_echo_when_ensure_ready_then_sandbox_unresponsive_without_retry() {
        let executor = Arc::new(
            RecordingExecutor::new()
                .on("echo 'zeipo-ready'", CommandOutput::ok("garbage"))
                .forbid("docker")
                .forbid("pkill"),
        );
        let clock = Arc::new(ManualClock::default());

        let err = prober(executor.clone(), clock).ensure_ready(false).unwrap_err();

        assert!(matches!(
            err,
            LaunchError::SandboxUnresponsive { ref actual, .. } if actual == "garbage"
        ));
        assert_eq!(executor.calls().len(), 1);
    }

    #[test]
    fn given_runtime_never_up_when_ensure_ready_then_exact_restart_budget_used() {
        let executor = Arc::new(
            RecordingExecutor::new()
                .on("echo 'zeipo-ready'", CommandOutput::ok("zeipo-ready"))
                .on("docker version", CommandOutput::failed(1, "Cannot connect")),
        );
        let clock = Arc::new(ManualClock::default());

        let err = prober(executor.clone(), clock.clone())
            .ensure_ready(false)
            .unwrap_err();

        match err {
            LaunchError::RuntimeStartFailed {
                attempts,
                last_status,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_status, RuntimeStatus::Down);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(executor.count_matching("nohup dockerd"), 2);
        assert_eq!(executor.count_matching("pkill -9 -x 'dockerd'"), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn given_runtime_recovers_after_first_restart_when_ensure_ready_then_ready() {
        let executor = Arc::new(
            RecordingExecutor::new()
                .on("echo 'zeipo-ready'", CommandOutput::ok("zeipo-ready"))
                .on_sequence(
                    "docker version",
                    vec![CommandOutput::failed(1, "down")],
                    CommandOutput::ok("24.0.7"),
                )
                .on("docker info", CommandOutput::ok("24.0.7")),
        );
        let clock = Arc::new(ManualClock::default());

        let session = prober(executor.clone(), clock).ensure_ready(false).unwrap();

        assert_eq!(session.restarts, 1);
        assert_eq!(executor.count_matching("nohup dockerd"), 1);
    }

    #[test]
    fn given_hanging_engine_when_status_checked_then_degraded_and_repaired() {
        let executor = Arc::new(
            RecordingExecutor::new()
                .on("echo 'zeipo-ready'", CommandOutput::ok("zeipo-ready"))
                .on("docker version", CommandOutput::ok("24.0.7"))
                .on("docker info", CommandOutput::failed(124, "")),
        );
        let clock = Arc::new(ManualClock::default());
        let prober = prober(executor.clone(), clock);

        assert_eq!(prober.runtime_status(), RuntimeStatus::Degraded);

        let err = prober.ensure_ready(false).unwrap_err();
        assert!(matches!(
            err,
            LaunchError::RuntimeStartFailed {
                last_status: RuntimeStatus::Degraded,
                ..
            }
        ));
        assert!(executor.count_matching("timeout 10 docker info") > 0);
    }

    #[test]
    fn given_force_restart_when_ensure_ready_then_runtime_killed_and_delay_applied() {
        let executor = Arc::new(healthy().forbid("dockerd >"));
        let clock = Arc::new(ManualClock::default());

        let session = prober(executor.clone(), clock.clone())
            .ensure_ready(true)
            .unwrap();

        assert_eq!(session.restarts, 0);
        assert_eq!(executor.count_matching("pkill -9 -x 'containerd'"), 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
    }
}
