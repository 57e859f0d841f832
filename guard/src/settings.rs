//! Tunables for the guard core.
//!
//! Deserialized from the `[guard]` table of the daemon configuration; every
//! field has a default so an empty table is valid.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardSettings {
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub lockdown: LockdownSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub host: HostSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_sshd_config")]
    pub sshd_config: PathBuf,
    #[serde(default = "default_proxies")]
    pub proxies: Vec<ProxyService>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            sshd_config: default_sshd_config(),
            proxies: default_proxies(),
        }
    }
}

/// A proxy daemon whose listening ports must stay reachable
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyService {
    /// Substring matched against process command lines and the socket table
    pub name: String,
    /// Config files read when the process runs without observable sockets
    #[serde(default)]
    pub config_files: Vec<PathBuf>,
    /// Directories whose `*.json` files are read as extra config
    #[serde(default)]
    pub config_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockdownSettings {
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
}

impl LockdownSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

impl Default for LockdownSettings {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_monitor_backoff")]
    pub backoff_seconds: u64,
    /// Start the loop when the daemon starts
    #[serde(default)]
    pub autostart: bool,
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_monitor_interval(),
            backoff_seconds: default_monitor_backoff(),
            autostart: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSettings {
    #[serde(default = "default_os_release")]
    pub os_release: PathBuf,
    #[serde(default = "default_timezone_file")]
    pub timezone_file: PathBuf,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            os_release: default_os_release(),
            timezone_file: default_timezone_file(),
        }
    }
}

// Default value functions
fn default_sshd_config() -> PathBuf { "/etc/ssh/sshd_config".into() }
fn default_grace_period() -> u64 { 5 }
fn default_monitor_interval() -> u64 { 300 }
fn default_monitor_backoff() -> u64 { 60 }
fn default_os_release() -> PathBuf { "/etc/os-release".into() }
fn default_timezone_file() -> PathBuf { "/etc/timezone".into() }

fn default_proxies() -> Vec<ProxyService> {
    vec![
        ProxyService {
            name: "xray".into(),
            config_files: vec![
                "/usr/local/etc/xray/config.json".into(),
                "/etc/xray/config.json".into(),
            ],
            config_dirs: vec!["/usr/local/etc/xray/conf".into()],
        },
        ProxyService {
            name: "sing-box".into(),
            config_files: vec![
                "/etc/sing-box/config.json".into(),
                "/usr/local/etc/sing-box/config.json".into(),
            ],
            config_dirs: vec!["/etc/sing-box/conf".into()],
        },
    ]
}
