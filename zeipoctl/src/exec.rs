use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

/// Process-spawn boundary. Everything the launcher does to the host or the
/// sandbox goes through one of these calls.
pub trait CommandExecutor {
    /// Runs to completion with stdin closed, capturing stdout and stderr.
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Runs with inherited stdio and returns the exit code.
    fn execute_interactive(&self, program: &str, args: &[&str]) -> Result<i32>;

    /// Starts a process that outlives the launcher, with stdout and stderr
    /// appended to `log_path`. Returns the child's process id.
    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> Result<u32>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute command: {} {:?}", program, args))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn execute_interactive(&self, program: &str, args: &[&str]) -> Result<i32> {
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("Failed to execute command: {} {:?}", program, args))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> Result<u32> {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory '{}'", parent.display())
                })?;
            }
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open log file '{}'", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| "Failed to duplicate log file handle")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn detached process: {} {:?}", program, args))?;

        // The child is intentionally not waited on; it keeps running after we exit.
        Ok(child.id())
    }
}

/// One recorded call against a [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub detached: bool,
}

impl Invocation {
    /// Program and arguments joined by spaces, which is what rules match against.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

enum Reply {
    Always(CommandOutput),
    Sequence(VecDeque<CommandOutput>, CommandOutput),
    Forbidden,
}

struct Rule {
    needle: String,
    reply: Reply,
}

/// Scripted command executor used in tests where shelling out is undesirable.
///
/// Rules are matched in insertion order against the full command line by
/// substring. Unmatched commands get the default output (success, empty).
pub struct RecordingExecutor {
    rules: Mutex<Vec<Rule>>,
    default: CommandOutput,
    calls: Mutex<Vec<Invocation>>,
    next_pid: Mutex<u32>,
    spawn_logs: Mutex<Vec<PathBuf>>,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default: CommandOutput::ok(""),
            calls: Mutex::new(Vec::new()),
            next_pid: Mutex::new(4242),
            spawn_logs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, output: CommandOutput) -> Self {
        self.default = output;
        self
    }

    pub fn on(self, needle: impl Into<String>, output: CommandOutput) -> Self {
        self.push_rule(needle.into(), Reply::Always(output));
        self
    }

    /// Replies with each output in turn, then repeats `then` forever.
    pub fn on_sequence(
        self,
        needle: impl Into<String>,
        outputs: Vec<CommandOutput>,
        then: CommandOutput,
    ) -> Self {
        self.push_rule(needle.into(), Reply::Sequence(outputs.into(), then));
        self
    }

    /// Any command containing `needle` panics the test.
    pub fn forbid(self, needle: impl Into<String>) -> Self {
        self.push_rule(needle.into(), Reply::Forbidden);
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.command_line().contains(needle))
            .count()
    }

    pub fn spawned_log_paths(&self) -> Vec<PathBuf> {
        self.spawn_logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn push_rule(&self, needle: String, reply: Reply) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule { needle, reply });
        }
    }

    fn record(&self, program: &str, args: &[&str], detached: bool) -> Invocation {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            detached,
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        invocation
    }

    fn reply_for(&self, invocation: &Invocation) -> CommandOutput {
        let line = invocation.command_line();
        let mut rules = match self.rules.lock() {
            Ok(rules) => rules,
            Err(_) => return self.default.clone(),
        };

        for rule in rules.iter_mut() {
            if !line.contains(&rule.needle) {
                continue;
            }
            return match &mut rule.reply {
                Reply::Always(output) => output.clone(),
                Reply::Sequence(queue, then) => queue.pop_front().unwrap_or_else(|| then.clone()),
                Reply::Forbidden => {
                    panic!("forbidden command issued: {} (rule '{}')", line, rule.needle)
                }
            };
        }
        self.default.clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let invocation = self.record(program, args, false);
        Ok(self.reply_for(&invocation))
    }

    fn execute_interactive(&self, program: &str, args: &[&str]) -> Result<i32> {
        let invocation = self.record(program, args, false);
        Ok(self.reply_for(&invocation).status)
    }

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> Result<u32> {
        let invocation = self.record(program, args, true);
        let reply = self.reply_for(&invocation);
        if !reply.success() {
            anyhow::bail!("Failed to spawn detached process: {}", reply.stderr.trim());
        }
        if let Ok(mut logs) = self.spawn_logs.lock() {
            logs.push(log_path.to_path_buf());
        }
        let mut pid = self
            .next_pid
            .lock()
            .map_err(|_| anyhow::anyhow!("pid counter poisoned"))?;
        *pid += 1;
        Ok(*pid)
    }
}
