use env_file::EnvFileError;
use thiserror::Error;

use crate::readiness::RuntimeStatus;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Sandbox environment is unresponsive (expected '{expected}', got '{actual}')")]
    SandboxUnresponsive { expected: String, actual: String },

    #[error(
        "Container runtime failed to start after {attempts} restart attempts (last status: {last_status})"
    )]
    RuntimeStartFailed {
        attempts: u32,
        last_status: RuntimeStatus,
    },

    #[error(
        "Tunnel URL not found in {log_path} after {attempts} polls; tunnel process {pid} was left running"
    )]
    TunnelUrlNotFound {
        attempts: u32,
        log_path: String,
        pid: u32,
    },

    #[error("Config file not found: {path}. Create it first (for example from .env.example)")]
    ConfigFileMissing { path: String },

    #[error("Tunnel CLI '{binary}' is not installed or not on PATH")]
    CloudflareCliMissing { binary: String },

    #[error(transparent)]
    Command(#[from] anyhow::Error),
}

impl LaunchError {
    /// Process exit status for this failure. The launcher exposes no finer
    /// error codes than success/failure.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<EnvFileError> for LaunchError {
    fn from(err: EnvFileError) -> Self {
        match err {
            EnvFileError::Missing { path } => LaunchError::ConfigFileMissing { path },
            other => LaunchError::Command(anyhow::Error::new(other)),
        }
    }
}
