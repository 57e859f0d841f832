//! Operation surface consumed by the chat transport.
//!
//! [`PortGuard`] is the single context object: it owns discovery, the
//! firewall adapter (behind the mutation lock), the lockdown controller, the
//! monitor and the event bus. Every operation returns an
//! [`OperationResult`]; no error crosses this boundary. Authorisation is the
//! caller's job.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::discovery::{DiscoveryReport, PortDiscovery, PortSource};
use crate::events::{EventBus, EventPayload, EventSeverity};
use crate::exec::CommandRunner;
use crate::firewall::{Backend, FirewallAdapter};
use crate::host;
use crate::lockdown::{LockdownController, LockdownState};
use crate::monitor::{MonitorSupervisor, MonitoringLoop};
use crate::rules::{Port, RuleSet};
use crate::settings::GuardSettings;

/// A request from the transport, e.g. `{"op": "lockdown", "requested_by": "alice"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    GetStatus,
    DiscoverPorts,
    GetFirewallStatus,
    Lockdown { requested_by: String },
    AutoSetupFirewall,
    StartMonitoring,
    StopMonitoring,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retained: Vec<Port>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<Port>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
            retained: Vec::new(),
            removed: Vec::new(),
            data: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(detail)
        }
    }

    fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => self.data = Some(value),
            Err(e) => warn!("Failed to serialize operation data: {e}"),
        }
        self
    }
}

/// Payload of `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub hostname: String,
    pub timezone: String,
    pub local_time: String,
    pub backend: Backend,
    pub ssh_port: u16,
    pub monitoring: bool,
    pub lockdown_state: LockdownState,
    pub uptime_seconds: u64,
}

/// Payload of `get_firewall_status`
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStatus {
    pub backend: Backend,
    pub status_text: String,
    /// `None` when the listing failed and the rules are unknown
    pub rules: Option<RuleSet>,
}

pub struct PortGuard {
    runner: Arc<dyn CommandRunner>,
    settings: GuardSettings,
    discovery: Arc<PortDiscovery>,
    firewall: Arc<Mutex<FirewallAdapter>>,
    events: Arc<EventBus>,
    lockdown: Arc<LockdownController>,
    monitor: MonitorSupervisor,
    started_at: Instant,
}

impl PortGuard {
    /// Detects the firewall backend and wires every component.
    pub async fn new(runner: Arc<dyn CommandRunner>, settings: GuardSettings) -> Self {
        let firewall = FirewallAdapter::detect(runner.clone()).await;
        Self::with_firewall(runner, settings, firewall)
    }

    pub fn with_firewall(
        runner: Arc<dyn CommandRunner>,
        settings: GuardSettings,
        firewall: FirewallAdapter,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let discovery = Arc::new(PortDiscovery::new(
            runner.clone(),
            settings.discovery.clone(),
        ));
        let firewall = Arc::new(Mutex::new(firewall));

        let lockdown = Arc::new(LockdownController::new(
            discovery.clone(),
            firewall.clone(),
            events.clone(),
            settings.lockdown.grace_period(),
        ));
        let monitor = MonitorSupervisor::new(
            Arc::new(MonitoringLoop::new(
                discovery.clone(),
                firewall.clone(),
                events.clone(),
                settings.monitor.interval(),
                settings.monitor.backoff(),
            )),
            events.clone(),
        );

        Self {
            runner,
            settings,
            discovery,
            firewall,
            events,
            lockdown,
            monitor,
            started_at: Instant::now(),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub fn monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    pub async fn invoke(&self, operation: Operation) -> OperationResult {
        info!("Invoking {:?}", operation);
        match operation {
            Operation::GetStatus => self.get_status().await,
            Operation::DiscoverPorts => self.discover_ports().await,
            Operation::GetFirewallStatus => self.get_firewall_status().await,
            Operation::Lockdown { requested_by } => self.lockdown(&requested_by).await,
            Operation::AutoSetupFirewall => self.auto_setup_firewall().await,
            Operation::StartMonitoring => self.start_monitoring(),
            Operation::StopMonitoring => self.stop_monitoring().await,
        }
    }

    pub async fn get_status(&self) -> OperationResult {
        let status = HostStatus {
            hostname: host::hostname(),
            timezone: host::timezone(self.runner.as_ref(), &self.settings.host.timezone_file)
                .await,
            local_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            backend: self.firewall.lock().await.backend(),
            ssh_port: self.discovery.ssh_port().number(),
            monitoring: self.monitoring(),
            lockdown_state: self.lockdown.state(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        };

        let detail = format!(
            "Host {} ({}), local time {}, firewall {}, SSH port {}, monitoring {}",
            status.hostname,
            status.timezone,
            status.local_time,
            status.backend,
            status.ssh_port,
            if status.monitoring { "on" } else { "off" }
        );
        OperationResult::ok(detail).with_data(&status)
    }

    pub async fn discover_ports(&self) -> OperationResult {
        let report = self.discovery.discover().await;
        OperationResult::ok(describe_discovery(&report)).with_data(&report)
    }

    pub async fn get_firewall_status(&self) -> OperationResult {
        let firewall = self.firewall.lock().await;
        let backend = firewall.backend();
        if !backend.is_active() {
            return OperationResult::failure("No active firewall");
        }

        let status_text = match firewall.status_report().await {
            Ok(text) => text,
            Err(e) => return OperationResult::failure(format!("Failed to query {backend}: {e}")),
        };
        let (rules, detail) = match firewall.list_rules().await {
            Ok(rules) => {
                let detail = format!("Firewall {backend}, allowed ports: {rules}");
                (Some(rules), detail)
            }
            Err(e) => (None, format!("Firewall {backend}, allowed ports unknown: {e}")),
        };

        OperationResult::ok(detail).with_data(&FirewallStatus {
            backend,
            status_text,
            rules,
        })
    }

    pub async fn lockdown(&self, requested_by: &str) -> OperationResult {
        let outcome = self.lockdown.run(requested_by).await;
        let detail = match (&outcome.state, &outcome.reason) {
            (LockdownState::Done, _) => format!(
                "Lockdown complete: {} rule(s) removed, {} port(s) kept open",
                outcome.removed.len(),
                outcome.retained.len()
            ),
            (_, Some(reason)) => format!("Lockdown failed: {reason}"),
            _ => "Lockdown failed".to_string(),
        };

        let mut result = if outcome.is_done() {
            OperationResult::ok(detail)
        } else {
            OperationResult::failure(detail)
        };
        result.retained = outcome.retained.clone();
        result.removed = outcome.removed.clone();
        result.with_data(&outcome)
    }

    pub async fn auto_setup_firewall(&self) -> OperationResult {
        let current = self.firewall.lock().await.backend();
        if current.is_active() {
            return OperationResult::ok(format!("Firewall {current} is already active"));
        }

        let keep_open = self.discovery.all_service_ports().await;
        let mut firewall = self.firewall.lock().await;
        // Another caller may have installed while discovery ran
        if firewall.backend().is_active() {
            return OperationResult::ok(format!(
                "Firewall {} is already active",
                firewall.backend()
            ));
        }

        match firewall.install(&self.settings.host.os_release, &keep_open).await {
            Backend::None => OperationResult::failure("Firewall installation failed"),
            backend => {
                self.events.publish(
                    EventSeverity::Info,
                    EventPayload::FirewallInstalled { backend },
                );
                let mut result = OperationResult::ok(format!(
                    "Installed and enabled {backend}, allowing {keep_open}"
                ));
                result.retained = keep_open.ports();
                result
            }
        }
    }

    pub fn start_monitoring(&self) -> OperationResult {
        if self.monitor.start() {
            OperationResult::ok(format!(
                "Monitoring started, every {}s",
                self.settings.monitor.interval_seconds
            ))
        } else {
            OperationResult::failure("Monitoring is already running")
        }
    }

    pub async fn stop_monitoring(&self) -> OperationResult {
        if self.monitor.stop().await {
            OperationResult::ok("Monitoring stopped")
        } else {
            OperationResult::failure("Monitoring is not running")
        }
    }
}

fn describe_discovery(report: &DiscoveryReport) -> String {
    let mut lines = vec![
        format!("Detected ports: {}", report.desired),
        format!("SSH port: {}", report.ssh_port),
    ];
    for service in &report.services {
        let line = match (service.running, service.source) {
            (false, _) => format!("{}: not running", service.name),
            (true, PortSource::None) => {
                format!("{}: running, but no ports detected", service.name)
            }
            (true, source) => format!(
                "{}: ports {} (from {})",
                service.name,
                service
                    .ports
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                match source {
                    PortSource::Sockets => "sockets",
                    _ => "config",
                }
            ),
        };
        lines.push(line);
    }
    lines.join("\n")
}
