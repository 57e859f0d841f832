//! Converges the backend's rules to a desired rule set.
//!
//! Backends that can remove a single rule get a selective diff: removals
//! first, then additions, then one commit. Backends that cannot are wiped,
//! given the default-deny baseline and re-allowed. Individual failures are
//! recorded and the run continues.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{GuardError, GuardResult};
use crate::firewall::{Backend, FirewallAdapter};
use crate::rules::{join_ports, Port, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Selective,
    FullReset,
}

/// Changes needed to go from `actual` to `desired`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub strategy: Strategy,
    pub to_remove: Vec<Port>,
    pub to_add: Vec<Port>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.strategy == Strategy::Selective && self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Computes the change set.
///
/// With [`Strategy::FullReset`], `to_add` holds every desired rule, since
/// the wipe drops everything. `desired` already carries the per-service
/// protocols (SSH tcp only, proxies tcp and udp).
pub fn plan(desired: &RuleSet, actual: &RuleSet, selective: bool) -> Plan {
    if selective {
        Plan {
            strategy: Strategy::Selective,
            to_remove: actual.difference(desired),
            to_add: desired.difference(actual),
        }
    } else {
        Plan {
            strategy: Strategy::FullReset,
            to_remove: actual.difference(desired),
            to_add: desired.ports(),
        }
    }
}

/// An adapter call that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOp {
    pub operation: String,
    pub reason: String,
}

impl FailedOp {
    fn new(operation: impl Into<String>, error: &GuardError) -> Self {
        Self {
            operation: operation.into(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub backend: Backend,
    pub strategy: Strategy,
    /// Ports whose allow rule is gone after the run
    pub removed: Vec<Port>,
    /// Ports allowed during the run
    pub added: Vec<Port>,
    pub failed: Vec<FailedOp>,
}

impl ReconcileReport {
    fn new(backend: Backend, strategy: Strategy) -> Self {
        Self {
            backend,
            strategy,
            removed: Vec::new(),
            added: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies `plan(desired, actual)` through `adapter`.
///
/// Errors only when no backend is active; command failures end up in
/// [`ReconcileReport::failed`].
pub async fn reconcile(
    adapter: &FirewallAdapter,
    desired: &RuleSet,
    actual: &RuleSet,
) -> GuardResult<ReconcileReport> {
    let driver = adapter.driver()?;
    let plan = plan(desired, actual, driver.selective_removal());
    info!(
        "Reconciling {} ({:?}): remove [{}], add [{}]",
        adapter.backend(),
        plan.strategy,
        join_ports(&plan.to_remove),
        join_ports(&plan.to_add)
    );

    let report = match plan.strategy {
        Strategy::Selective => apply_selective(adapter, &plan).await,
        Strategy::FullReset => apply_full_reset(adapter, &plan).await,
    };

    if !report.is_success() {
        warn!(
            "Reconciliation finished with {} failed operation(s)",
            report.failed.len()
        );
    }
    Ok(report)
}

async fn apply_selective(adapter: &FirewallAdapter, plan: &Plan) -> ReconcileReport {
    let mut report = ReconcileReport::new(adapter.backend(), Strategy::Selective);
    if plan.is_noop() {
        return report;
    }

    for &port in &plan.to_remove {
        match adapter.stage_revoke(port).await {
            Ok(()) => report.removed.push(port),
            Err(e) => report.failed.push(FailedOp::new(format!("remove {port}"), &e)),
        }
    }
    for &port in &plan.to_add {
        match adapter.stage_allow(port).await {
            Ok(()) => report.added.push(port),
            Err(e) => report.failed.push(FailedOp::new(format!("add {port}"), &e)),
        }
    }
    if let Err(e) = adapter.commit().await {
        report.failed.push(FailedOp::new("commit", &e));
    }
    report
}

async fn apply_full_reset(adapter: &FirewallAdapter, plan: &Plan) -> ReconcileReport {
    let mut report = ReconcileReport::new(adapter.backend(), Strategy::FullReset);

    match adapter.reset_to_baseline().await {
        Ok(()) => report.removed = plan.to_remove.clone(),
        Err(e) => report.failed.push(FailedOp::new("reset", &e)),
    }
    for &port in &plan.to_add {
        match adapter.stage_allow(port).await {
            Ok(()) => report.added.push(port),
            Err(e) => report.failed.push(FailedOp::new(format!("add {port}"), &e)),
        }
    }
    if let Err(e) = adapter.commit().await {
        report.failed.push(FailedOp::new("commit", &e));
    }
    if let Err(e) = adapter.enable().await {
        report.failed.push(FailedOp::new("enable", &e));
    }
    report
}

/// Re-allows every desired rule without removing anything. Allowing a
/// present rule is a no-op for both backends.
pub async fn reassert(adapter: &FirewallAdapter, desired: &RuleSet) -> GuardResult<ReconcileReport> {
    adapter.driver()?;
    let mut report = ReconcileReport::new(adapter.backend(), Strategy::Selective);
    for port in desired.ports() {
        match adapter.stage_allow(port).await {
            Ok(()) => report.added.push(port),
            Err(e) => report.failed.push(FailedOp::new(format!("add {port}"), &e)),
        }
    }
    if let Err(e) = adapter.commit().await {
        report.failed.push(FailedOp::new("commit", &e));
    }
    Ok(report)
}
