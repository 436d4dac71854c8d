//! 命令执行能力：宿主机 / docker exec
//!
//! Checks never spawn processes themselves; every command goes through a
//! [`ContainerProvider`] so tests can script the responses.

use std::process::Command;

use tracing::debug;

use crate::utils::{DiagError, Result};

/// Captured streams of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Short failure description: stderr when present, otherwise the exit status.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr_str();
        match (stderr.is_empty(), self.exit_code) {
            (false, _) => stderr,
            (true, Some(code)) => format!("exit status {}", code),
            (true, None) => "terminated by signal".to_string(),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(o: std::process::Output) -> Self {
        Self {
            stdout: o.stdout,
            stderr: o.stderr,
            exit_code: o.status.code(),
        }
    }
}

/// Execution surface a check runs commands against.
///
/// `Err` means the command could not be started at all. A command that ran
/// and exited non-zero is `Ok` with a non-zero `exit_code`, so its stdout is
/// still available to the caller.
pub trait ContainerProvider: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, target: &str, command: &[&str]) -> Result<CommandOutput>;

    fn execute_as_user(&self, target: &str, user: &str, command: &[&str]) -> Result<CommandOutput>;

    fn is_installed(&self, name: &str) -> bool;
}

// ── docker exec ─────────────────────────────────────────────────────────────

pub struct DockerProvider {
    binary: String,
}

impl DockerProvider {
    pub fn new() -> Self {
        Self { binary: "docker".to_string() }
    }

    fn exec(&self, target: &str, user: Option<&str>, command: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec");
        if let Some(user) = user {
            cmd.args(["-u", user]);
        }
        cmd.arg(target).args(command);

        debug!(target, ?command, "docker exec");
        cmd.output()
            .map(CommandOutput::from)
            .map_err(|e| DiagError::Provider(format!("{} exec failed: {}", self.binary, e)))
    }
}

impl Default for DockerProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    fn execute(&self, target: &str, command: &[&str]) -> Result<CommandOutput> {
        self.exec(target, None, command)
    }

    fn execute_as_user(&self, target: &str, user: &str, command: &[&str]) -> Result<CommandOutput> {
        self.exec(target, Some(user), command)
    }

    fn is_installed(&self, name: &str) -> bool {
        which(name)
    }
}

// ── 宿主机 ───────────────────────────────────────────────────────────────────

/// Runs commands on the local machine; `target` is ignored.
pub struct HostProvider;

impl ContainerProvider for HostProvider {
    fn name(&self) -> &str {
        "host"
    }

    fn execute(&self, _target: &str, command: &[&str]) -> Result<CommandOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DiagError::Provider("empty command".to_string()))?;

        debug!(?command, "host exec");
        Command::new(program)
            .args(args)
            .output()
            .map(CommandOutput::from)
            .map_err(|e| DiagError::Provider(format!("{} failed: {}", program, e)))
    }

    fn execute_as_user(&self, target: &str, user: &str, command: &[&str]) -> Result<CommandOutput> {
        let mut wrapped = vec!["sudo", "-n", "-u", user, "--"];
        wrapped.extend_from_slice(command);
        self.execute(target, &wrapped)
    }

    fn is_installed(&self, name: &str) -> bool {
        which(name)
    }
}

fn which(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// ── 测试用脚本化 provider ─────────────────────────────────────────────────────
