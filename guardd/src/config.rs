//! portguard-agent configuration loading and parsing

use anyhow::{Context, Result};
use portguard::settings::GuardSettings;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/portguard/config.toml";

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub privilege: PrivilegeConfig,
    #[serde(default)]
    pub guard: GuardSettings,
}

#[derive(Debug, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PrivilegeConfig {
    /// Prefix for privileged commands; empty when running as root
    #[serde(default = "default_escalation")]
    pub escalation: Vec<String>,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            escalation: default_escalation(),
        }
    }
}

// Default value functions
fn default_log_level() -> String { "info".into() }
fn default_listen_address() -> String { "127.0.0.1:9480".into() }
fn default_escalation() -> Vec<String> { vec!["sudo".into(), "-n".into()] }

/// Parses a configuration document.
pub fn parse_config(content: &str) -> Result<AgentConfig> {
    toml::from_str(content).context("Invalid portguard configuration")
}

/// Where the loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at the path; built-in defaults apply
    Defaults(PathBuf),
}

/// Load configuration from `PORTGUARD_CONFIG` or /etc/portguard/config.toml
///
/// Runs before logging is set up, so nothing is logged here; the caller
/// reports the returned source.
pub fn load_config() -> Result<(AgentConfig, ConfigSource)> {
    let config_path = std::env::var("PORTGUARD_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&config_path))
}

pub fn load_config_from(path: &Path) -> Result<(AgentConfig, ConfigSource)> {
    if !path.exists() {
        return Ok((AgentConfig::default(), ConfigSource::Defaults(path.to_path_buf())));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config = parse_config(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;
    Ok((config, ConfigSource::File(path.to_path_buf())))
}
