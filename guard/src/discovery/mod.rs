//! Port discovery: the set of ports that must stay reachable.
//!
//! Sources, merged and deduplicated:
//! - the SSH daemon's configured port (tcp)
//! - listening sockets of each running proxy process (tcp + udp)
//! - for a proxy that runs without observable sockets, the ports declared in
//!   its known config files (tcp + udp)
//!
//! Discovery never fails: unreachable queries and broken configs are logged
//! and contribute nothing.

pub mod config;
pub mod sockets;

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GuardError;
use crate::exec::{CommandRunner, CommandSpec, QUERY_TIMEOUT, RULE_TIMEOUT};
use crate::rules::{Port, RuleSet};
use crate::settings::{DiscoverySettings, ProxyService};

pub use config::config_ports;

/// Where a service's ports were found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSource {
    Sockets,
    Config,
    None,
}

/// A proxy process as seen by one discovery pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceProcess {
    pub name: String,
    pub running: bool,
    pub ports: BTreeSet<u16>,
    pub source: PortSource,
}

/// Result of a full discovery pass
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub ssh_port: u16,
    pub services: Vec<ServiceProcess>,
    pub desired: RuleSet,
}

pub struct PortDiscovery {
    runner: Arc<dyn CommandRunner>,
    settings: DiscoverySettings,
}

impl PortDiscovery {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: DiscoverySettings) -> Self {
        Self { runner, settings }
    }

    pub fn proxies(&self) -> &[ProxyService] {
        &self.settings.proxies
    }

    /// The SSH daemon's listen port, 22 when absent or unreadable.
    pub fn ssh_port(&self) -> Port {
        std::fs::read_to_string(&self.settings.sshd_config)
            .ok()
            .and_then(|content| sockets::parse_sshd_port(&content))
            .and_then(Port::tcp)
            .unwrap_or(Port::DEFAULT_SSH)
    }

    /// True when a process command line contains `name`.
    pub async fn is_running(&self, name: &str) -> bool {
        let spec = CommandSpec::new("pgrep", &["-f", name], QUERY_TIMEOUT);
        match self.runner.run(&spec).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!("Process check for {name} failed: {e}");
                false
            }
        }
    }

    /// Listening ports of the process `name`; empty when it is not running.
    pub async fn process_ports(&self, name: &str) -> BTreeSet<u16> {
        if !self.is_running(name).await {
            return BTreeSet::new();
        }

        match self.socket_table().await {
            Ok(table) => sockets::parse_socket_table(&table, name),
            Err(e) => {
                warn!("Socket table unavailable, no ports for {name}: {e}");
                BTreeSet::new()
            }
        }
    }

    /// `ss -tlnp`, falling back to `netstat -tlnp` when ss is unusable.
    async fn socket_table(&self) -> Result<String, GuardError> {
        let ss = CommandSpec::privileged("ss", &["-tlnp"], RULE_TIMEOUT);
        match self.runner.run(&ss).await {
            Ok(output) if output.success() => return Ok(output.stdout),
            Ok(output) => debug!("ss exited with {:?}, trying netstat", output.status),
            Err(GuardError::CommandUnavailable { .. }) => debug!("ss not installed, trying netstat"),
            Err(e) => return Err(e),
        }

        let netstat = CommandSpec::privileged("netstat", &["-tlnp"], RULE_TIMEOUT);
        let output = self.runner.run(&netstat).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(GuardError::Discovery(format!(
                "netstat exited with {:?}",
                output.status
            )))
        }
    }

    /// Existing config files of `service`: the listed files, then the
    /// `*.json` files of each config directory in name order.
    pub fn config_candidates(&self, service: &ProxyService) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = service
            .config_files
            .iter()
            .filter(|path| path.is_file())
            .cloned()
            .collect();

        for dir in &service.config_dirs {
            candidates.extend(json_files_in(dir));
        }
        candidates
    }

    /// One proxy's state for this pass.
    pub async fn inspect(&self, service: &ProxyService) -> ServiceProcess {
        let running = self.is_running(&service.name).await;
        if !running {
            return ServiceProcess {
                name: service.name.clone(),
                running,
                ports: BTreeSet::new(),
                source: PortSource::None,
            };
        }

        let from_sockets = match self.socket_table().await {
            Ok(table) => sockets::parse_socket_table(&table, &service.name),
            Err(e) => {
                warn!("Socket table unavailable for {}: {e}", service.name);
                BTreeSet::new()
            }
        };
        if !from_sockets.is_empty() {
            return ServiceProcess {
                name: service.name.clone(),
                running,
                ports: from_sockets,
                source: PortSource::Sockets,
            };
        }

        let from_config: BTreeSet<u16> = self
            .config_candidates(service)
            .iter()
            .flat_map(|path| config_ports(path))
            .collect();
        let source = if from_config.is_empty() {
            PortSource::None
        } else {
            PortSource::Config
        };

        ServiceProcess {
            name: service.name.clone(),
            running,
            ports: from_config,
            source,
        }
    }

    /// Full pass over SSH and every configured proxy.
    pub async fn discover(&self) -> DiscoveryReport {
        let ssh = self.ssh_port();
        let mut desired = RuleSet::new();
        desired.insert(ssh);

        let mut services = Vec::with_capacity(self.settings.proxies.len());
        for proxy in &self.settings.proxies {
            let process = self.inspect(proxy).await;
            if process.running {
                info!(
                    "Detected {} ports {:?} (source: {:?})",
                    process.name, process.ports, process.source
                );
            }
            for &number in &process.ports {
                desired.insert_both(number);
            }
            services.push(process);
        }

        DiscoveryReport {
            ssh_port: ssh.number(),
            services,
            desired,
        }
    }

    /// The desired rule set: SSH plus every discovered proxy port.
    pub async fn all_service_ports(&self) -> RuleSet {
        self.discover().await.desired
    }
}

fn json_files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}
