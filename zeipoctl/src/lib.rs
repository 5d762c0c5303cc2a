//! Developer launcher for the Zeipo voice stack: sandbox and container
//! runtime readiness, API port reconciliation across the host and the
//! sandbox, and the quick tunnel that exposes the API to the telephony
//! provider.

pub mod clock;
pub mod commands;
pub mod compose;
pub mod environment;
pub mod error;
pub mod exec;
pub mod launcher;
pub mod output;
pub mod poll;
pub mod ports;
pub mod readiness;
pub mod settings;
pub mod tunnel;
pub mod voice;
pub mod webhooks;

pub use error::LaunchError;
