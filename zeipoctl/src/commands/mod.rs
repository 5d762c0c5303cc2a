pub mod compose;
pub mod doctor;
pub mod env;
pub mod ports;
pub mod tunnel;
pub mod voice;
pub mod webhooks;

use crate::output;
use crate::ports::{PortState, ReconciliationReport};

/// One status line per environment that did not end up free.
pub(crate) fn warn_unreleased(report: &ReconciliationReport) {
    for outcome in &report.outcomes {
        match &outcome.state {
            PortState::Free => {}
            PortState::StillOccupied { owners } => output::warn(format!(
                "Port {} still in use in {} ({}); continuing",
                report.port,
                outcome.environment,
                describe_owners(owners)
            )),
            PortState::Unknown { reason } => output::warn(format!(
                "Could not verify port {} in {}: {}",
                report.port, outcome.environment, reason
            )),
        }
    }
}

pub(crate) fn describe_owners(owners: &[crate::environment::PortBinding]) -> String {
    owners
        .iter()
        .map(|o| match (&o.owner_name, o.owner_pid) {
            (Some(name), Some(pid)) => format!("{} [{}]", name, pid),
            (None, Some(pid)) => format!("pid {}", pid),
            (Some(name), None) => name.clone(),
            (None, None) => "unknown owner".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
