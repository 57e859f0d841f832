//! Scripted command runner for exercising discovery and firewall logic
//! without touching the host.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{GuardError, GuardResult};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};

#[derive(Debug, Clone)]
enum Reply {
    Exit { status: i32, stdout: String },
    Missing,
    Timeout,
}

/// A recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command_line: String,
    pub privileged: bool,
    pub timeout: Duration,
}

/// Answers commands by command-line prefix and records every call.
///
/// Rules are checked in registration order; the first prefix that matches
/// wins. Unmatched commands exit with status 1 and no output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with `status` and print `stdout`.
    pub fn on(self, prefix: &str, status: i32, stdout: &str) -> Self {
        self.push(prefix, Reply::Exit { status, stdout: stdout.to_string() });
        self
    }

    /// Commands starting with `prefix` succeed with `stdout`.
    pub fn ok(self, prefix: &str, stdout: &str) -> Self {
        self.on(prefix, 0, stdout)
    }

    /// Commands starting with `prefix` are not installed.
    pub fn missing(self, prefix: &str) -> Self {
        self.push(prefix, Reply::Missing);
        self
    }

    /// Commands starting with `prefix` run past their timeout.
    pub fn timeout(self, prefix: &str) -> Self {
        self.push(prefix, Reply::Timeout);
        self
    }

    fn push(&self, prefix: &str, reply: Reply) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((prefix.to_string(), reply));
        }
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.recorded().into_iter().map(|c| c.command_line).collect()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines that went through the elevation path.
    pub fn privileged_calls(&self) -> Vec<String> {
        self.recorded()
            .into_iter()
            .filter(|c| c.privileged)
            .map(|c| c.command_line)
            .collect()
    }

    /// Privileged commands other than listings and status queries.
    pub fn mutations(&self) -> Vec<String> {
        self.privileged_calls()
            .into_iter()
            .filter(|line| {
                !line.starts_with("ufw status")
                    && !line.starts_with("firewall-cmd --list")
                    && !line.starts_with("ss ")
                    && !line.starts_with("netstat ")
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> GuardResult<CommandOutput> {
        let line = spec.command_line();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                command_line: line.clone(),
                privileged: spec.privileged,
                timeout: spec.timeout,
            });
        }

        let reply = self
            .rules
            .lock()
            .ok()
            .and_then(|rules| {
                rules
                    .iter()
                    .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                    .map(|(_, reply)| reply.clone())
            });

        match reply {
            Some(Reply::Exit { status, stdout }) => Ok(CommandOutput {
                status: Some(status),
                stdout,
                ..Default::default()
            }),
            Some(Reply::Missing) => Err(GuardError::CommandUnavailable {
                program: spec.program.clone(),
            }),
            Some(Reply::Timeout) => Err(GuardError::Command {
                command: line,
                reason: format!("timed out after {:?}", spec.timeout),
            }),
            None => Ok(CommandOutput {
                status: Some(1),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::QUERY_TIMEOUT;

    #[tokio::test]
    async fn test_first_matching_prefix_wins() {
        let runner = ScriptedRunner::new()
            .ok("ufw status numbered", "numbered")
            .ok("ufw status", "plain");

        let out = runner
            .run(&CommandSpec::new("ufw", &["status", "numbered"], QUERY_TIMEOUT))
            .await
            .unwrap();
        assert_eq!(out.stdout, "numbered");

        let out = runner
            .run(&CommandSpec::new("ufw", &["status"], QUERY_TIMEOUT))
            .await
            .unwrap();
        assert_eq!(out.stdout, "plain");
        assert_eq!(runner.calls(), vec!["ufw status numbered", "ufw status"]);
    }

    #[tokio::test]
    async fn test_unmatched_exits_one() {
        let runner = ScriptedRunner::new();
        let out = runner
            .run(&CommandSpec::new("pgrep", &["-f", "xray"], QUERY_TIMEOUT))
            .await
            .unwrap();
        assert_eq!(out.status, Some(1));
    }

    #[tokio::test]
    async fn test_missing_and_timeout() {
        let runner = ScriptedRunner::new().missing("ss").timeout("netstat");
        let err = runner
            .run(&CommandSpec::new("ss", &["-tlnp"], QUERY_TIMEOUT))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::CommandUnavailable { .. }));

        let err = runner
            .run(&CommandSpec::new("netstat", &["-tlnp"], QUERY_TIMEOUT))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
