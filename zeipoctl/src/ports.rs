//! Port reconciliation across the host and sandbox namespaces.
//!
//! The outcome is advisory: a port that is still occupied afterwards is
//! reported, never raised as an error.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::environment::{Environment, EnvironmentKind, PortBinding};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PortState {
    Free,
    StillOccupied { owners: Vec<PortBinding> },
    /// The socket table could not be read, so freedom is unknown.
    Unknown { reason: String },
}

impl PortState {
    pub fn is_free(&self) -> bool {
        matches!(self, PortState::Free)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentOutcome {
    pub environment: EnvironmentKind,
    pub killed: Vec<u32>,
    pub failures: Vec<String>,
    pub state: PortState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub port: u16,
    pub outcomes: Vec<EnvironmentOutcome>,
}

impl ReconciliationReport {
    pub fn state(&self, environment: EnvironmentKind) -> Option<&PortState> {
        self.outcomes
            .iter()
            .find(|o| o.environment == environment)
            .map(|o| &o.state)
    }

    pub fn is_free_everywhere(&self) -> bool {
        self.outcomes.iter().all(|o| o.state.is_free())
    }
}

struct Sweep {
    killed: Vec<u32>,
    failures: Vec<String>,
}

pub struct PortReconciler {
    clock: Arc<dyn Clock>,
    service_patterns: Vec<String>,
}

impl PortReconciler {
    pub fn new(clock: Arc<dyn Clock>, service_patterns: Vec<String>) -> Self {
        Self {
            clock,
            service_patterns,
        }
    }

    /// Terminates every listener on `port` in each environment, waits
    /// `wait`, then re-scans each environment independently.
    pub fn release_port(
        &self,
        environments: &[&dyn Environment],
        port: u16,
        wait: Duration,
    ) -> ReconciliationReport {
        let sweeps: Vec<(EnvironmentKind, Sweep)> = environments
            .iter()
            .map(|env| (env.kind(), self.sweep(*env, port)))
            .collect();

        self.clock.sleep(wait);

        let outcomes = environments
            .iter()
            .zip(sweeps)
            .map(|(env, (kind, sweep))| {
                let state = verify(*env, port);
                if !state.is_free() {
                    warn!(port, environment = %kind, ?state, "port still not free");
                }
                EnvironmentOutcome {
                    environment: kind,
                    killed: sweep.killed,
                    failures: sweep.failures,
                    state,
                }
            })
            .collect();

        ReconciliationReport { port, outcomes }
    }

    fn sweep(&self, env: &dyn Environment, port: u16) -> Sweep {
        let mut sweep = Sweep {
            killed: Vec::new(),
            failures: Vec::new(),
        };

        let listeners = match env.list_listeners_on_port(port) {
            Ok(listeners) => listeners,
            Err(err) => {
                warn!(port, environment = %env.kind(), error = %err, "listener scan failed");
                sweep.failures.push(format!("scan: {err:#}"));
                return sweep;
            }
        };

        if listeners.is_empty() {
            return sweep;
        }

        let mut pids: Vec<u32> = listeners.iter().filter_map(|b| b.owner_pid).collect();
        pids.sort_unstable();
        pids.dedup();

        for pid in pids {
            info!(port, pid, environment = %env.kind(), "terminating port owner");
            match env.kill_process(pid) {
                Ok(()) => sweep.killed.push(pid),
                Err(err) => sweep.failures.push(format!("kill {pid}: {err:#}")),
            }
        }

        if let Err(err) = env.sweep_port(port, &self.service_patterns) {
            sweep.failures.push(format!("sweep: {err:#}"));
        }

        sweep
    }
}

fn verify(env: &dyn Environment, port: u16) -> PortState {
    match env.list_listeners_on_port(port) {
        Ok(owners) if owners.is_empty() => PortState::Free,
        Ok(owners) => PortState::StillOccupied { owners },
        Err(err) => PortState::Unknown {
            reason: format!("{err:#}"),
        },
    }
}
