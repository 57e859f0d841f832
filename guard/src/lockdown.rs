//! Lockdown: remove every firewall rule that does not belong to a
//! discovered service.
//!
//! `Idle -> Announced -> Applying -> Done | Failed`. The grace delay between
//! announcement and application is a fixed warning window; nothing cancels
//! it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::discovery::PortDiscovery;
use crate::events::{EventBus, EventPayload, EventSeverity};
use crate::firewall::FirewallAdapter;
use crate::reconcile::{reconcile, FailedOp};
use crate::rules::{Port, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockdownState {
    Idle,
    Announced,
    Applying,
    Done,
    Failed,
}

impl LockdownState {
    pub fn in_progress(&self) -> bool {
        matches!(self, LockdownState::Announced | LockdownState::Applying)
    }
}

/// One operator request, alive for a single run
#[derive(Debug, Clone)]
pub struct LockdownRequest {
    pub id: Uuid,
    pub requested_by: String,
    pub desired: RuleSet,
    pub created_at: DateTime<Utc>,
    pub grace: Duration,
}

impl LockdownRequest {
    pub fn new(requested_by: &str, desired: RuleSet, grace: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_by: requested_by.to_string(),
            desired,
            created_at: Utc::now(),
            grace,
        }
    }
}

/// Terminal result of a run, handed back to the transport
#[derive(Debug, Clone, Serialize)]
pub struct LockdownOutcome {
    pub request_id: String,
    pub requested_by: String,
    pub state: LockdownState,
    pub retained: Vec<Port>,
    pub removed: Vec<Port>,
    pub failed: Vec<FailedOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl LockdownOutcome {
    fn failed(request: &LockdownRequest, reason: impl Into<String>) -> Self {
        Self {
            request_id: request.id.to_string(),
            requested_by: request.requested_by.clone(),
            state: LockdownState::Failed,
            retained: Vec::new(),
            removed: Vec::new(),
            failed: Vec::new(),
            reason: Some(reason.into()),
            finished_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == LockdownState::Done
    }
}

pub struct LockdownController {
    discovery: Arc<PortDiscovery>,
    firewall: Arc<Mutex<FirewallAdapter>>,
    events: Arc<EventBus>,
    grace: Duration,
    state: StdMutex<LockdownState>,
    last_outcome: StdMutex<Option<LockdownOutcome>>,
}

impl LockdownController {
    pub fn new(
        discovery: Arc<PortDiscovery>,
        firewall: Arc<Mutex<FirewallAdapter>>,
        events: Arc<EventBus>,
        grace: Duration,
    ) -> Self {
        Self {
            discovery,
            firewall,
            events,
            grace,
            state: StdMutex::new(LockdownState::Idle),
            last_outcome: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> LockdownState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(LockdownState::Idle)
    }

    pub fn last_outcome(&self) -> Option<LockdownOutcome> {
        self.last_outcome.lock().ok().and_then(|o| o.clone())
    }

    fn transition(&self, to: LockdownState) {
        if let Ok(mut state) = self.state.lock() {
            info!("Lockdown state {:?} -> {:?}", *state, to);
            *state = to;
        }
    }

    /// Claims the controller for a new run. False while another run is
    /// between announcement and application.
    fn begin(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) if !state.in_progress() => {
                *state = LockdownState::Announced;
                true
            }
            _ => false,
        }
    }

    /// Discovers the desired set and locks the firewall down to it.
    pub async fn run(self: &Arc<Self>, requested_by: &str) -> LockdownOutcome {
        let desired = self.discovery.all_service_ports().await;
        self.run_with(requested_by, desired).await
    }

    /// Locks the firewall down to `desired`.
    ///
    /// Once claimed, the run continues on its own task, so dropping the
    /// returned future never strands the controller between announcement
    /// and a terminal state.
    pub async fn run_with(
        self: &Arc<Self>,
        requested_by: &str,
        desired: RuleSet,
    ) -> LockdownOutcome {
        let request = LockdownRequest::new(requested_by, desired, self.grace);

        if !self.begin() {
            warn!("Lockdown requested by {requested_by} while another is in progress");
            return LockdownOutcome::failed(&request, "another lockdown is in progress");
        }

        let controller = Arc::clone(self);
        let task = tokio::spawn({
            let request = request.clone();
            async move { controller.execute(request).await }
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Lockdown {} task ended abnormally: {e}", request.id);
                self.finish(LockdownOutcome::failed(&request, "lockdown task ended abnormally"))
            }
        }
    }

    async fn execute(&self, request: LockdownRequest) -> LockdownOutcome {
        if request.desired.is_empty() {
            warn!("Lockdown refused: no service ports discovered");
            return self.finish(LockdownOutcome::failed(
                &request,
                "no service ports discovered, refusing to remove every rule",
            ));
        }

        let backend = self.firewall.lock().await.backend();
        if !backend.is_active() {
            warn!("Lockdown refused: no active firewall");
            return self.finish(LockdownOutcome::failed(&request, "no active firewall"));
        }

        info!(
            "Lockdown {} requested by {}, keeping {} in {:?}",
            request.id, request.requested_by, request.desired, request.grace
        );
        self.events.publish(
            EventSeverity::Critical,
            EventPayload::LockdownAnnounced {
                request_id: request.id.to_string(),
                requested_by: request.requested_by.clone(),
                retained: request.desired.ports(),
                grace_seconds: request.grace.as_secs(),
            },
        );
        tokio::time::sleep(request.grace).await;

        self.transition(LockdownState::Applying);
        let outcome = self.apply(&request).await;
        self.finish(outcome)
    }

    async fn apply(&self, request: &LockdownRequest) -> LockdownOutcome {
        let firewall = self.firewall.lock().await;

        let actual = match firewall.list_rules().await {
            Ok(actual) => actual,
            Err(e) => {
                error!("Lockdown aborted, current rules unknown: {e}");
                return LockdownOutcome::failed(request, e.to_string());
            }
        };

        match reconcile(&firewall, &request.desired, &actual).await {
            Ok(report) => {
                let state = if report.is_success() {
                    LockdownState::Done
                } else {
                    LockdownState::Failed
                };
                let reason = (!report.is_success())
                    .then(|| format!("{} firewall operation(s) failed", report.failed.len()));
                LockdownOutcome {
                    request_id: request.id.to_string(),
                    requested_by: request.requested_by.clone(),
                    state,
                    retained: request.desired.ports(),
                    removed: report.removed,
                    failed: report.failed,
                    reason,
                    finished_at: Utc::now(),
                }
            }
            Err(e) => LockdownOutcome::failed(request, e.to_string()),
        }
    }

    fn finish(&self, outcome: LockdownOutcome) -> LockdownOutcome {
        self.transition(outcome.state);
        if let Ok(mut last) = self.last_outcome.lock() {
            *last = Some(outcome.clone());
        }

        let severity = if outcome.is_done() {
            EventSeverity::Info
        } else {
            EventSeverity::Critical
        };
        self.events.publish(
            severity,
            EventPayload::LockdownFinished {
                outcome: outcome.clone(),
            },
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::Backend;
    use crate::settings::DiscoverySettings;
    use crate::testing::ScriptedRunner;

    fn controller(
        runner: &Arc<ScriptedRunner>,
        backend: Backend,
    ) -> (Arc<LockdownController>, Arc<EventBus>) {
        controller_with_grace(runner, backend, Duration::from_millis(10))
    }

    fn controller_with_grace(
        runner: &Arc<ScriptedRunner>,
        backend: Backend,
        grace: Duration,
    ) -> (Arc<LockdownController>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let discovery = Arc::new(PortDiscovery::new(
            runner.clone(),
            DiscoverySettings {
                sshd_config: "/nonexistent/sshd_config".into(),
                proxies: Vec::new(),
            },
        ));
        let firewall = Arc::new(Mutex::new(FirewallAdapter::new(runner.clone(), backend)));
        let controller = LockdownController::new(discovery, firewall, events.clone(), grace);
        (Arc::new(controller), events)
    }

    fn ports(spec: &[&str]) -> RuleSet {
        spec.iter().map(|p| p.parse::<Port>().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_empty_desired_fails_without_mutation() {
        let runner = Arc::new(ScriptedRunner::new().ok("firewall-cmd", "80/tcp\n"));
        let (controller, events) = controller(&runner, Backend::Firewalld);

        let outcome = controller.run_with("ops", RuleSet::new()).await;
        assert_eq!(outcome.state, LockdownState::Failed);
        assert_eq!(controller.state(), LockdownState::Failed);
        assert!(runner.mutations().is_empty());
        assert!(runner.calls().is_empty());
        // Refusal is reported, but never announced
        let recent = events.recent();
        assert_eq!(recent.len(), 1);
        assert!(matches!(recent[0].payload, EventPayload::LockdownFinished { .. }));
    }

    #[tokio::test]
    async fn test_lockdown_removes_unknown_rules() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("firewall-cmd --list-ports", "22/tcp 80/tcp 443/tcp\n")
                .ok("firewall-cmd", ""),
        );
        let (controller, events) = controller(&runner, Backend::Firewalld);

        let outcome = controller
            .run_with("ops", ports(&["22/tcp", "443/tcp", "443/udp"]))
            .await;
        assert!(outcome.is_done(), "{outcome:?}");
        assert_eq!(outcome.removed, vec![Port::tcp(80).unwrap()]);
        assert_eq!(outcome.retained.len(), 3);
        assert_eq!(
            runner.mutations(),
            vec![
                "firewall-cmd --permanent --remove-port 80/tcp",
                "firewall-cmd --permanent --add-port 443/udp",
                "firewall-cmd --reload",
            ]
        );

        let recent = events.recent();
        assert!(matches!(recent[0].payload, EventPayload::LockdownAnnounced { .. }));
        assert!(matches!(recent[1].payload, EventPayload::LockdownFinished { .. }));
        assert_eq!(controller.last_outcome().unwrap().state, LockdownState::Done);
    }

    #[tokio::test]
    async fn test_listing_failure_refuses() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("firewall-cmd --list-ports", 252, "")
                .ok("firewall-cmd", ""),
        );
        let (controller, _) = controller(&runner, Backend::Firewalld);

        let outcome = controller.run_with("ops", ports(&["22/tcp"])).await;
        assert_eq!(outcome.state, LockdownState::Failed);
        assert!(outcome.reason.unwrap().contains("listing"));
        assert!(runner.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_no_backend_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, events) =
            controller_with_grace(&runner, Backend::None, Duration::from_secs(30));

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            controller.run_with("ops", ports(&["22/tcp"])),
        )
        .await
        .unwrap();
        assert_eq!(outcome.state, LockdownState::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("no active firewall"));
        assert!(runner.calls().is_empty());
        // Refused before any announcement or grace wait
        let recent = events.recent();
        assert_eq!(recent.len(), 1);
        assert!(matches!(recent[0].payload, EventPayload::LockdownFinished { .. }));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_wedge_controller() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("firewall-cmd --list-ports", "22/tcp 80/tcp\n")
                .ok("firewall-cmd", ""),
        );
        let (controller, events) =
            controller_with_grace(&runner, Backend::Firewalld, Duration::from_millis(200));

        // The caller goes away during the grace window
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            controller.run_with("alice", ports(&["22/tcp"])),
        )
        .await;
        assert!(dropped.is_err());
        assert!(controller.state().in_progress());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(controller.state(), LockdownState::Done);
        let first = controller.last_outcome().unwrap();
        assert_eq!(first.requested_by, "alice");
        assert_eq!(first.removed, vec![Port::tcp(80).unwrap()]);
        assert!(events
            .recent()
            .iter()
            .any(|e| matches!(e.payload, EventPayload::LockdownFinished { .. })));

        let second = controller.run_with("bob", ports(&["22/tcp"])).await;
        assert!(second.is_done(), "{second:?}");
        assert_eq!(second.requested_by, "bob");
    }

    #[tokio::test]
    async fn test_concurrent_request_is_refused() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("firewall-cmd --list-ports", "22/tcp\n")
                .ok("firewall-cmd", ""),
        );
        let (controller, _) =
            controller_with_grace(&runner, Backend::Firewalld, Duration::from_millis(100));

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run_with("alice", ports(&["22/tcp"])).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = controller.run_with("bob", ports(&["22/tcp"])).await;
        assert_eq!(second.state, LockdownState::Failed);
        assert_eq!(second.reason.as_deref(), Some("another lockdown is in progress"));
        assert!(first.await.unwrap().is_done());
    }

    #[tokio::test]
    async fn test_ufw_lockdown_resets() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("ufw status numbered", "[ 1] 22/tcp ALLOW IN Anywhere\n[ 2] 3306/tcp ALLOW IN Anywhere\n")
                .ok("ufw", ""),
        );
        let (controller, _) = controller(&runner, Backend::Ufw);

        let outcome = controller.run_with("ops", ports(&["22/tcp"])).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.removed, vec![Port::tcp(3306).unwrap()]);
        assert_eq!(runner.mutations()[0], "ufw --force reset");
        assert_eq!(runner.mutations().last().unwrap(), "ufw --force enable");
    }

    #[tokio::test]
    async fn test_partial_failure_is_failed() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("firewall-cmd --list-ports", "22/tcp 80/tcp\n")
                .on("firewall-cmd --permanent --remove-port", 1, "")
                .ok("firewall-cmd", ""),
        );
        let (controller, _) = controller(&runner, Backend::Firewalld);

        let outcome = controller.run_with("ops", ports(&["22/tcp"])).await;
        assert_eq!(outcome.state, LockdownState::Failed);
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_run_discovers_ssh_only() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("firewall-cmd --list-ports", "22/tcp 8080/tcp\n")
                .ok("firewall-cmd", ""),
        );
        let (controller, _) = controller(&runner, Backend::Firewalld);

        let outcome = controller.run("ops").await;
        assert!(outcome.is_done());
        assert_eq!(outcome.retained, vec![Port::DEFAULT_SSH]);
        assert_eq!(outcome.removed, vec![Port::tcp(8080).unwrap()]);
    }
}
