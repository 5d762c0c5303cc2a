//! Wires settings, the process-spawn boundary and the clock into the
//! orchestrator components a command needs.

use env_file::EnvFile;
use std::sync::Arc;

use crate::clock::Clock;
use crate::environment::{
    Environment, HostEnvironment, HostPlatform, SandboxBridge, SandboxEnvironment,
};
use crate::exec::CommandExecutor;
use crate::ports::{PortReconciler, ReconciliationReport};
use crate::readiness::ReadinessProber;
use crate::settings::{BridgeMode, Settings};
use crate::tunnel::{FileTunnelLog, TunnelLog, TunnelManager};

pub struct Launcher {
    pub settings: Settings,
    pub host: Arc<dyn Environment>,
    pub sandbox: Arc<dyn Environment>,
    pub clock: Arc<dyn Clock>,
    pub tunnel_log: Arc<dyn TunnelLog>,
}

impl Launcher {
    pub fn new(
        settings: Settings,
        executor: Arc<dyn CommandExecutor>,
        clock: Arc<dyn Clock>,
        platform: HostPlatform,
    ) -> Self {
        let bridge = sandbox_bridge(&settings, platform);
        let host: Arc<dyn Environment> = Arc::new(HostEnvironment::new(executor.clone(), platform));
        let sandbox: Arc<dyn Environment> = Arc::new(SandboxEnvironment::new(executor, bridge));
        let tunnel_log: Arc<dyn TunnelLog> = Arc::new(FileTunnelLog::new(
            settings.tunnel.log_path.clone(),
            settings.tunnel.tail_bytes,
        ));
        Self {
            settings,
            host,
            sandbox,
            clock,
            tunnel_log,
        }
    }

    pub fn with_tunnel_log(mut self, log: Arc<dyn TunnelLog>) -> Self {
        self.tunnel_log = log;
        self
    }

    pub fn prober(&self) -> ReadinessProber {
        ReadinessProber::new(
            self.sandbox.clone(),
            self.clock.clone(),
            self.settings.sandbox.sentinel.clone(),
            self.settings.runtime.clone(),
        )
    }

    pub fn reconciler(&self) -> PortReconciler {
        PortReconciler::new(self.clock.clone(), self.settings.api.service_patterns.clone())
    }

    pub fn tunnels(&self) -> TunnelManager {
        TunnelManager::new(
            self.host.clone(),
            self.tunnel_log.clone(),
            self.clock.clone(),
            self.settings.tunnel.clone(),
        )
    }

    pub fn env_file(&self) -> EnvFile {
        EnvFile::new(self.settings.env_file.clone())
    }

    /// Releases `port` on the host and in the sandbox.
    pub fn release_port(&self, port: u16) -> ReconciliationReport {
        let environments: [&dyn Environment; 2] = [self.host.as_ref(), self.sandbox.as_ref()];
        self.reconciler()
            .release_port(&environments, port, self.settings.api.release_wait)
    }
}

pub fn sandbox_bridge(settings: &Settings, platform: HostPlatform) -> SandboxBridge {
    let wsl = || SandboxBridge::Wsl {
        distro: settings.sandbox.distro.clone(),
    };
    match settings.sandbox.bridge {
        BridgeMode::Wsl => wsl(),
        BridgeMode::Direct => SandboxBridge::Direct,
        BridgeMode::Auto => match platform {
            HostPlatform::Windows => wsl(),
            HostPlatform::Unix => SandboxBridge::Direct,
        },
    }
}
