//! Error types for discovery and firewall operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::firewall::Backend;

/// Errors raised inside the guard core.
///
/// None of these escape an operation boundary: the lockdown controller, the
/// monitor tick and the operation surface turn them into structured results.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A process or socket query could not be answered.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// No firewall backend is active on this host.
    #[error("No active firewall backend")]
    BackendUnavailable,

    /// An external command exited non-zero or ran past its timeout.
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// The program is not installed.
    #[error("Command `{program}` is not available on this host")]
    CommandUnavailable { program: String },

    /// A service configuration document could not be parsed.
    #[error("Failed to parse {}: {reason}", path.display())]
    ConfigParse { path: PathBuf, reason: String },

    /// The backend's rule listing failed, so the actual state is unknown.
    #[error("Rule listing for {backend} failed: {reason}")]
    UnknownRuleState { backend: Backend, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// True when the command ran past its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GuardError::Command { reason, .. } if reason.starts_with("timed out"))
    }
}

pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_mentions_command() {
        let err = GuardError::Command {
            command: "ufw status".to_string(),
            reason: "exit status 1".to_string(),
        };
        assert!(err.to_string().contains("ufw status"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_detection() {
        let err = GuardError::Command {
            command: "sleep 10".to_string(),
            reason: "timed out after 100ms".to_string(),
        };
        assert!(err.is_timeout());
    }

    #[test]
    fn test_config_parse_error_mentions_path() {
        let err = GuardError::ConfigParse {
            path: PathBuf::from("/etc/sing-box/config.json"),
            reason: "expected value".to_string(),
        };
        assert!(err.to_string().contains("/etc/sing-box/config.json"));
    }

    #[test]
    fn test_unknown_rule_state() {
        let err = GuardError::UnknownRuleState {
            backend: Backend::Firewalld,
            reason: "exit status 252".to_string(),
        };
        assert!(err.to_string().contains("firewalld"));
    }
}
