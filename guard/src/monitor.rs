//! Monitoring loop: periodically re-asserts the desired rules.
//!
//! Each tick rediscovers the desired set and re-probes the backend. With an
//! active backend every desired rule is allowed again (no removals); without
//! one a degraded warning is published. A tick error shortens the next wait
//! to the backoff. Cancellation is observed between ticks only.

use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::PortDiscovery;
use crate::error::GuardResult;
use crate::events::{EventBus, EventPayload, EventSeverity};
use crate::firewall::{Backend, FirewallAdapter};
use crate::reconcile::{reassert, ReconcileReport};

/// What one tick observed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickStatus {
    Enforced { report: ReconcileReport },
    Degraded,
}

pub struct MonitoringLoop {
    discovery: Arc<PortDiscovery>,
    firewall: Arc<Mutex<FirewallAdapter>>,
    events: Arc<EventBus>,
    interval: Duration,
    backoff: Duration,
}

impl MonitoringLoop {
    pub fn new(
        discovery: Arc<PortDiscovery>,
        firewall: Arc<Mutex<FirewallAdapter>>,
        events: Arc<EventBus>,
        interval: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            discovery,
            firewall,
            events,
            interval,
            backoff,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn tick(&self) -> GuardResult<TickStatus> {
        let desired = self.discovery.all_service_ports().await;
        let firewall = self.firewall.lock().await;

        if firewall.probe().await == Backend::None {
            warn!("Monitor: no active firewall, {} left unprotected", desired);
            self.events.publish(
                EventSeverity::Warning,
                EventPayload::MonitorDegraded {
                    reason: "no active firewall backend".to_string(),
                },
            );
            return Ok(TickStatus::Degraded);
        }

        let report = reassert(&firewall, &desired).await?;
        let severity = if report.is_success() {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        debug!("Monitor: {} enforced on {}", desired, report.backend);
        self.events.publish(
            severity,
            EventPayload::MonitorStatus {
                backend: report.backend,
                desired: desired.ports(),
                failed: report.failed.clone(),
            },
        );
        Ok(TickStatus::Enforced { report })
    }

    /// Runs until `cancel` fires. The first tick runs immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Monitor started (interval {:?})", self.interval);
        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    wait = match self.tick().await {
                        Ok(_) => self.interval,
                        Err(e) => {
                            error!("Monitor tick failed: {e}");
                            self.events.publish(
                                EventSeverity::Warning,
                                EventPayload::MonitorError {
                                    error: e.to_string(),
                                    retry_in_seconds: self.backoff.as_secs(),
                                },
                            );
                            self.backoff
                        }
                    };
                }
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Start/stop control over one [`MonitoringLoop`]
pub struct MonitorSupervisor {
    monitor: Arc<MonitoringLoop>,
    events: Arc<EventBus>,
    running: StdMutex<Option<Running>>,
}

impl MonitorSupervisor {
    pub fn new(monitor: Arc<MonitoringLoop>, events: Arc<EventBus>) -> Self {
        Self {
            monitor,
            events,
            running: StdMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.task.is_finished()))
            .unwrap_or(false)
    }

    /// Spawns the loop. False when it is already running.
    pub fn start(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            return false;
        };
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.monitor.clone().run(cancel.clone()));
        *running = Some(Running { cancel, task });
        self.events.publish(
            EventSeverity::Info,
            EventPayload::MonitorStarted {
                interval_seconds: self.monitor.interval().as_secs(),
            },
        );
        true
    }

    /// Cancels the loop and waits for it to leave. False when it was not
    /// running.
    pub async fn stop(&self) -> bool {
        let taken = self.running.lock().ok().and_then(|mut r| r.take());
        let Some(Running { cancel, task }) = taken else {
            return false;
        };
        let was_running = !task.is_finished();
        cancel.cancel();
        if let Err(e) = task.await {
            warn!("Monitor task ended abnormally: {e}");
        }
        if was_running {
            self.events
                .publish(EventSeverity::Info, EventPayload::MonitorStopped);
        }
        was_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardError;
    use crate::settings::DiscoverySettings;
    use crate::testing::ScriptedRunner;

    fn monitor(
        runner: &Arc<ScriptedRunner>,
        cached: Backend,
        interval: Duration,
    ) -> (Arc<MonitoringLoop>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let discovery = Arc::new(PortDiscovery::new(
            runner.clone(),
            DiscoverySettings {
                sshd_config: "/nonexistent/sshd_config".into(),
                proxies: Vec::new(),
            },
        ));
        let firewall = Arc::new(Mutex::new(FirewallAdapter::new(runner.clone(), cached)));
        let monitor = MonitoringLoop::new(
            discovery,
            firewall,
            events.clone(),
            interval,
            Duration::from_millis(5),
        );
        (Arc::new(monitor), events)
    }

    fn firewalld_active() -> ScriptedRunner {
        ScriptedRunner::new()
            .ok("systemctl is-active firewalld", "active\n")
            .ok("firewall-cmd", "")
    }

    #[tokio::test]
    async fn test_tick_reasserts_desired() {
        let runner = Arc::new(firewalld_active());
        let (monitor, events) = monitor(&runner, Backend::Firewalld, Duration::from_secs(300));

        let status = monitor.tick().await.unwrap();
        assert!(matches!(status, TickStatus::Enforced { .. }));
        assert_eq!(
            runner.mutations(),
            vec![
                "firewall-cmd --permanent --add-port 22/tcp",
                "firewall-cmd --reload",
            ]
        );
        assert!(matches!(
            events.recent()[0].payload,
            EventPayload::MonitorStatus { .. }
        ));
    }

    #[tokio::test]
    async fn test_tick_degraded_without_backend() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("systemctl is-active firewalld", 3, "inactive\n")
                .ok("ufw status", "Status: inactive\n"),
        );
        let (monitor, events) = monitor(&runner, Backend::Ufw, Duration::from_secs(300));

        let status = monitor.tick().await.unwrap();
        assert!(matches!(status, TickStatus::Degraded));
        assert!(runner.mutations().is_empty());
        assert!(matches!(
            events.recent()[0].payload,
            EventPayload::MonitorDegraded { .. }
        ));
    }

    #[tokio::test]
    async fn test_tick_error_when_nothing_cached() {
        let runner = Arc::new(firewalld_active());
        let (monitor, _) = monitor(&runner, Backend::None, Duration::from_secs(300));
        let err = monitor.tick().await.unwrap_err();
        assert!(matches!(err, GuardError::BackendUnavailable));
    }

    #[tokio::test]
    async fn test_loop_ticks_until_cancelled() {
        let runner = Arc::new(firewalld_active());
        let (monitor, _) = monitor(&runner, Backend::Firewalld, Duration::from_millis(20));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let ticks = runner
            .calls()
            .iter()
            .filter(|c| c.starts_with("systemctl is-active"))
            .count();
        assert!(ticks >= 2, "expected several ticks, got {ticks}");

        let after = runner.calls().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.calls().len(), after);
    }

    #[tokio::test]
    async fn test_loop_backs_off_and_keeps_running() {
        let runner = Arc::new(firewalld_active());
        let (monitor, events) = monitor(&runner, Backend::None, Duration::from_secs(300));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap();

        // 5ms backoff instead of the 300s interval: several retries
        let errors = events
            .recent()
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::MonitorError { .. }))
            .count();
        assert!(errors >= 2, "expected retries, got {errors}");
    }

    #[tokio::test]
    async fn test_supervisor_start_stop() {
        let runner = Arc::new(firewalld_active());
        let (monitor, events) = monitor(&runner, Backend::Firewalld, Duration::from_secs(300));
        let supervisor = MonitorSupervisor::new(monitor, events);

        assert!(!supervisor.is_running());
        assert!(supervisor.start());
        assert!(supervisor.is_running());
        assert!(!supervisor.start());

        assert!(supervisor.stop().await);
        assert!(!supervisor.is_running());
        assert!(!supervisor.stop().await);
    }
}
