//! The two process namespaces the launcher works in: the host OS and the
//! nested sandbox (WSL on Windows hosts) that runs the container engine.
//!
//! Both expose the same operations so port reconciliation and process
//! lookup are written once against [`Environment`].

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::exec::{CommandExecutor, CommandOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Host,
    Sandbox,
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentKind::Host => write!(f, "host"),
            EnvironmentKind::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// A TCP listener observed in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub port: u16,
    pub environment: EnvironmentKind,
    /// `None` when the socket table shows the listener but not its owner
    /// (typically another user's process without root).
    pub owner_pid: Option<u32>,
    pub owner_name: Option<String>,
}

pub trait Environment {
    fn kind(&self) -> EnvironmentKind;

    /// Runs a POSIX shell script (`cmd /C` on Windows hosts) and captures output.
    fn run_shell(&self, script: &str) -> Result<CommandOutput>;

    /// Same as [`Environment::run_shell`] but attached to the terminal.
    fn run_interactive(&self, script: &str) -> Result<i32>;

    /// Runs `program` with `args` as separate arguments, no shell parsing.
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    fn list_listeners_on_port(&self, port: u16) -> Result<Vec<PortBinding>>;

    /// Force-terminates `pid`.
    fn kill_process(&self, pid: u32) -> Result<()>;

    /// Process ids whose executable name equals the file name of `program`.
    /// `program` may be a bare name or a full path.
    fn find_processes(&self, program: &str) -> Result<Vec<u32>>;

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> Result<u32>;

    /// Extra cleanup for a port that had listeners, beyond killing their owners.
    fn sweep_port(&self, _port: u16, _service_patterns: &[String]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Unix,
    Windows,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostPlatform::Windows
        } else {
            HostPlatform::Unix
        }
    }
}

pub struct HostEnvironment {
    executor: Arc<dyn CommandExecutor>,
    platform: HostPlatform,
}

impl HostEnvironment {
    pub fn new(executor: Arc<dyn CommandExecutor>, platform: HostPlatform) -> Self {
        Self { executor, platform }
    }

    pub fn platform(&self) -> HostPlatform {
        self.platform
    }
}

impl Environment for HostEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Host
    }

    fn run_shell(&self, script: &str) -> Result<CommandOutput> {
        match self.platform {
            HostPlatform::Unix => self.executor.execute("sh", &["-c", script]),
            HostPlatform::Windows => self.executor.execute("cmd", &["/C", script]),
        }
    }

    fn run_interactive(&self, script: &str) -> Result<i32> {
        match self.platform {
            HostPlatform::Unix => self.executor.execute_interactive("sh", &["-c", script]),
            HostPlatform::Windows => self.executor.execute_interactive("cmd", &["/C", script]),
        }
    }

    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.executor.execute(program, args)
    }

    fn list_listeners_on_port(&self, port: u16) -> Result<Vec<PortBinding>> {
        match self.platform {
            HostPlatform::Unix => {
                let filter = format!("-iTCP:{}", port);
                let output = self.executor.execute(
                    "lsof",
                    &["-nP", filter.as_str(), "-sTCP:LISTEN", "-Fpc"],
                )?;
                // lsof exits 1 when nothing matches.
                if !output.success() && output.stdout.trim().is_empty() {
                    return Ok(Vec::new());
                }
                Ok(parse_lsof_listeners(&output.stdout, port))
            }
            HostPlatform::Windows => {
                let output = self.executor.execute("netstat", &["-ano", "-p", "TCP"])?;
                if !output.success() {
                    anyhow::bail!("netstat failed: {}", output.stderr.trim());
                }
                Ok(parse_netstat_listeners(&output.stdout, port))
            }
        }
    }

    fn kill_process(&self, pid: u32) -> Result<()> {
        let pid_arg = pid.to_string();
        let output = match self.platform {
            HostPlatform::Unix => self.executor.execute("kill", &["-9", pid_arg.as_str()])?,
            HostPlatform::Windows => {
                self.executor
                    .execute("taskkill", &["/PID", pid_arg.as_str(), "/F"])?
            }
        };
        if !output.success() {
            anyhow::bail!("failed to kill host process {}: {}", pid, output.stderr.trim());
        }
        Ok(())
    }

    fn find_processes(&self, program: &str) -> Result<Vec<u32>> {
        let name = executable_name(program);
        match self.platform {
            HostPlatform::Unix => {
                let output = self.executor.execute("pgrep", &["-x", "--", comm_name(name)])?;
                Ok(parse_pid_lines(&output.stdout))
            }
            HostPlatform::Windows => {
                let image = if name.to_ascii_lowercase().ends_with(".exe") {
                    name.to_string()
                } else {
                    format!("{}.exe", name)
                };
                let filter = format!("IMAGENAME eq {}", image);
                let output = self
                    .executor
                    .execute("tasklist", &["/FO", "CSV", "/NH", "/FI", filter.as_str()])?;
                Ok(parse_tasklist_pids(&output.stdout))
            }
        }
    }

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> Result<u32> {
        self.executor.spawn_detached(program, args, log_path)
    }
}

/// How sandbox commands are reached from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxBridge {
    /// `wsl [-d <distro>] -e sh -c <script>`
    Wsl { distro: Option<String> },
    /// `sh -c <script>`, for hosts that already are the sandbox.
    Direct,
}

pub struct SandboxEnvironment {
    executor: Arc<dyn CommandExecutor>,
    bridge: SandboxBridge,
}

impl SandboxEnvironment {
    pub fn new(executor: Arc<dyn CommandExecutor>, bridge: SandboxBridge) -> Self {
        Self { executor, bridge }
    }

    fn invocation<'a>(&'a self, script: &'a str) -> (&'static str, Vec<&'a str>) {
        match &self.bridge {
            SandboxBridge::Wsl { distro } => {
                let mut args = Vec::with_capacity(6);
                if let Some(distro) = distro {
                    args.push("-d");
                    args.push(distro.as_str());
                }
                args.extend(["-e", "sh", "-c", script]);
                ("wsl", args)
            }
            SandboxBridge::Direct => ("sh", vec!["-c", script]),
        }
    }

    fn kill_matching(&self, pattern: &str) -> Result<()> {
        // Skip our own shell, whose command line contains the pattern too.
        let script = format!(
            "for p in $(pgrep -f -- {}); do [ \"$p\" != \"$$\" ] && kill -9 \"$p\"; done; true",
            shell_quote(pattern)
        );
        self.run_shell(&script).map(|_| ())
    }
}

impl Environment for SandboxEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Sandbox
    }

    fn run_shell(&self, script: &str) -> Result<CommandOutput> {
        let (program, args) = self.invocation(script);
        self.executor
            .execute(program, &args)
            .with_context(|| "Failed to reach sandbox shell")
    }

    fn run_interactive(&self, script: &str) -> Result<i32> {
        let (program, args) = self.invocation(script);
        self.executor.execute_interactive(program, &args)
    }

    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_shell(&quoted_command(program, args))
    }

    fn list_listeners_on_port(&self, port: u16) -> Result<Vec<PortBinding>> {
        let script = format!("ss -ltnpH 'sport = :{}'", port);
        let output = self.run_shell(&script)?;
        if !output.success() {
            anyhow::bail!("socket listing failed in sandbox: {}", output.stderr.trim());
        }
        Ok(parse_ss_listeners(&output.stdout, port))
    }

    fn kill_process(&self, pid: u32) -> Result<()> {
        let output = self.run_shell(&format!("kill -9 {}", pid))?;
        if !output.success() {
            anyhow::bail!(
                "failed to kill sandbox process {}: {}",
                pid,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    fn find_processes(&self, program: &str) -> Result<Vec<u32>> {
        let name = comm_name(executable_name(program));
        let script = format!("pgrep -x -- {}; true", shell_quote(name));
        let output = self.run_shell(&script)?;
        Ok(parse_pid_lines(&output.stdout))
    }

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> Result<u32> {
        let script = format!(
            "nohup {} >> {} 2>&1 & echo $!",
            quoted_command(program, args),
            shell_quote(&log_path.to_string_lossy())
        );
        let output = self.run_shell(&script)?;
        output
            .stdout
            .trim()
            .parse::<u32>()
            .with_context(|| format!("sandbox did not report a pid for {}", program))
    }

    fn sweep_port(&self, port: u16, service_patterns: &[String]) -> Result<()> {
        for pattern in service_patterns {
            if let Err(err) = self.kill_matching(pattern) {
                warn!(pattern = %pattern, error = %err, "pattern sweep failed");
            }
        }

        let script = format!(
            "ids=$(docker ps -q --filter publish={}); [ -z \"$ids\" ] || docker rm -f $ids",
            port
        );
        let output = self.run_shell(&script)?;
        if !output.success() {
            debug!(port, stderr = %output.stderr.trim(), "container sweep reported failure");
        }
        Ok(())
    }
}

/// Last path component of `program`, splitting on both `/` and `\\` so a
/// Windows path configured on any host resolves to its image name.
pub fn executable_name(program: &str) -> &str {
    program
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(program)
}

/// Linux keeps only the first 15 bytes of a process name, and `pgrep -x`
/// compares against that.
fn comm_name(name: &str) -> &str {
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn quoted_command(program: &str, args: &[&str]) -> String {
    let mut command = shell_quote(program);
    for arg in args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    command
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn parse_pid_lines(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Parses `lsof -F pc` field output: `p<pid>` starts a process set, `c<name>` names it.
pub fn parse_lsof_listeners(stdout: &str, port: u16) -> Vec<PortBinding> {
    let mut bindings: Vec<PortBinding> = Vec::new();
    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            if let Ok(pid) = pid.trim().parse::<u32>() {
                if bindings.iter().any(|b| b.owner_pid == Some(pid)) {
                    continue;
                }
                bindings.push(PortBinding {
                    port,
                    environment: EnvironmentKind::Host,
                    owner_pid: Some(pid),
                    owner_name: None,
                });
            }
        } else if let Some(name) = line.strip_prefix('c') {
            if let Some(last) = bindings.last_mut() {
                if last.owner_name.is_none() {
                    last.owner_name = Some(name.trim().to_string());
                }
            }
        }
    }
    bindings
}

/// Parses `netstat -ano` rows such as
/// `TCP    0.0.0.0:8000    0.0.0.0:0    LISTENING    1234`.
pub fn parse_netstat_listeners(stdout: &str, port: u16) -> Vec<PortBinding> {
    let suffix = format!(":{}", port);
    let mut bindings: Vec<PortBinding> = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if !fields[1].ends_with(&suffix) || !fields[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        let Ok(pid) = fields[4].parse::<u32>() else {
            continue;
        };
        if pid == 0 || bindings.iter().any(|b| b.owner_pid == Some(pid)) {
            continue;
        }
        bindings.push(PortBinding {
            port,
            environment: EnvironmentKind::Host,
            owner_pid: Some(pid),
            owner_name: None,
        });
    }
    bindings
}

static SS_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\("([^"]*)",pid=(\d+)"#).expect("valid ss users regex"));

/// Parses `ss -ltnpH` rows. The `users:((...))` column is only present when
/// the caller may see the owning process.
pub fn parse_ss_listeners(stdout: &str, port: u16) -> Vec<PortBinding> {
    let mut bindings: Vec<PortBinding> = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let mut owners = SS_USER.captures_iter(line).peekable();
        if owners.peek().is_none() {
            bindings.push(PortBinding {
                port,
                environment: EnvironmentKind::Sandbox,
                owner_pid: None,
                owner_name: None,
            });
            continue;
        }
        for caps in owners {
            let Ok(pid) = caps[2].parse::<u32>() else {
                continue;
            };
            if bindings.iter().any(|b| b.owner_pid == Some(pid)) {
                continue;
            }
            bindings.push(PortBinding {
                port,
                environment: EnvironmentKind::Sandbox,
                owner_pid: Some(pid),
                owner_name: Some(caps[1].to_string()),
            });
        }
    }
    bindings
}

/// Parses `tasklist /FO CSV /NH` rows: `"cloudflared.exe","1234",...`.
pub fn parse_tasklist_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| {
            let mut cols = line.split("\",\"");
            cols.next()?;
            cols.next()?.trim_matches('"').parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
