//! Command execution: the seam between the guard core and the host.
//!
//! Every external program (process queries, socket tables, firewall tools,
//! package managers) goes through a [`CommandRunner`]. The system runner
//! enforces the per-command timeout and prefixes privileged commands with a
//! configurable elevation argv, so the core never decides how root is
//! obtained.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{GuardError, GuardResult};

/// Timeout for lightweight queries (pgrep, timedatectl)
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for a single firewall rule change or listing
pub const RULE_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for heavy firewall operations (reset, enable)
pub const RESET_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for package manager runs
pub const PACKAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// A single external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Needs elevated privileges (firewall mutation, package install)
    pub privileged: bool,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str], timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            timeout,
            privileged: false,
        }
    }

    /// Same as [`CommandSpec::new`] but run through the elevation prefix.
    pub fn privileged(program: &str, args: &[&str], timeout: Duration) -> Self {
        Self {
            privileged: true,
            ..Self::new(program, args, timeout)
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Program and arguments joined by spaces, for logs and matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Capability to run external commands.
///
/// `Err` means the command could not be run to completion: the program is
/// missing, spawning failed, or the timeout expired. A non-zero exit is an
/// `Ok` output; use [`run_checked`] to treat it as a failure.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> GuardResult<CommandOutput>;
}

/// Runs `spec` and maps a non-zero exit to [`GuardError::Command`].
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> GuardResult<CommandOutput> {
    let output = runner.run(spec).await?;
    if output.success() {
        return Ok(output);
    }

    let reason = match output.status {
        Some(code) => format!("exit status {code}: {}", output.stderr.trim()),
        None => "terminated by signal".to_string(),
    };
    warn!("Command `{}` failed: {reason}", spec.command_line());
    Err(GuardError::Command {
        command: spec.command_line(),
        reason,
    })
}

/// Runs commands on the local host with `tokio::process`.
pub struct SystemRunner {
    /// Prepended to privileged commands, e.g. `["sudo", "-n"]`
    elevation: Vec<String>,
}

impl SystemRunner {
    pub fn new(elevation: Vec<String>) -> Self {
        Self { elevation }
    }

    /// A runner for processes that already hold the needed privileges.
    pub fn unprivileged() -> Self {
        Self::new(Vec::new())
    }

    /// Program and arguments actually spawned. Elevation wrappers such as
    /// sudo reset the environment, so a privileged command's variables are
    /// passed through `env` behind the prefix.
    fn argv(&self, spec: &CommandSpec) -> (String, Vec<String>) {
        match self.elevation.split_first() {
            Some((head, rest)) if spec.privileged => {
                let mut args: Vec<String> = rest.to_vec();
                if !spec.env.is_empty() {
                    args.push("env".to_string());
                    args.extend(spec.env.iter().map(|(key, value)| format!("{key}={value}")));
                }
                args.push(spec.program.clone());
                args.extend(spec.args.iter().cloned());
                (head.clone(), args)
            }
            _ => (spec.program.clone(), spec.args.clone()),
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> GuardResult<CommandOutput> {
        use tokio::process::Command;

        let start = Instant::now();
        let (program, args) = self.argv(spec);
        debug!("Running `{}` (timeout {:?})", spec.command_line(), spec.timeout);

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the wait future on timeout must not leave the child running
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GuardError::CommandUnavailable { program: program.clone() }
            } else {
                GuardError::Command {
                    command: spec.command_line(),
                    reason: format!("failed to spawn: {e}"),
                }
            }
        })?;

        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!("Command `{}` timed out after {:?}", spec.command_line(), spec.timeout);
                GuardError::Command {
                    command: spec.command_line(),
                    reason: format!("timed out after {:?}", spec.timeout),
                }
            })?
            .map_err(|e| GuardError::Command {
                command: spec.command_line(),
                reason: format!("failed to wait: {e}"),
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
