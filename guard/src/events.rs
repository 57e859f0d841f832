//! Event bus: notifications for the transport layer.
//!
//! The lockdown controller and the monitor publish here; the transport
//! subscribes and fans events out to every authorised recipient. A bounded
//! history of recent events is kept for late subscribers.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::firewall::Backend;
use crate::lockdown::LockdownOutcome;
use crate::reconcile::FailedOp;
use crate::rules::Port;

const CHANNEL_CAPACITY: usize = 256;
const MAX_RECENT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    LockdownAnnounced {
        request_id: String,
        requested_by: String,
        retained: Vec<Port>,
        grace_seconds: u64,
    },
    LockdownFinished {
        outcome: LockdownOutcome,
    },
    MonitorStarted {
        interval_seconds: u64,
    },
    MonitorStopped,
    MonitorStatus {
        backend: Backend,
        desired: Vec<Port>,
        failed: Vec<FailedOp>,
    },
    MonitorDegraded {
        reason: String,
    },
    MonitorError {
        error: String,
        retry_in_seconds: u64,
    },
    FirewallInstalled {
        backend: Backend,
    },
}

/// A published notification
#[derive(Debug, Clone, Serialize)]
pub struct GuardEvent {
    pub id: String,
    pub timestamp: i64,
    pub severity: EventSeverity,
    #[serde(flatten)]
    pub payload: EventPayload,
}

pub struct EventBus {
    sender: broadcast::Sender<GuardEvent>,
    recent: Mutex<VecDeque<GuardEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscriber is not an error.
    pub fn publish(&self, severity: EventSeverity, payload: EventPayload) -> GuardEvent {
        let event = GuardEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            severity,
            payload,
        };

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == MAX_RECENT {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        if self.sender.send(event.clone()).is_err() {
            debug!("No subscribers for event {}", event.id);
        }
        event
    }

    /// Recent events, oldest first.
    pub fn recent(&self) -> Vec<GuardEvent> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}
