//! Firewall adapter: one interface over the supported backends.
//!
//! Each backend is a [`FirewallDriver`] that only builds commands and parses
//! listings; [`FirewallAdapter`] runs them through the injected
//! [`CommandRunner`] and caches the detected backend.

pub mod firewalld;
pub mod install;
pub mod ufw;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{GuardError, GuardResult};
use crate::exec::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::rules::{Port, RuleSet};

pub use install::PackageFamily;

/// The firewall technology managing host rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    None,
    Firewalld,
    Ufw,
}

impl Backend {
    /// Probe order. Earlier entries win when several report active.
    pub const PRIORITY: [Backend; 2] = [Backend::Firewalld, Backend::Ufw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::None => "none",
            Backend::Firewalld => "firewalld",
            Backend::Ufw => "ufw",
        }
    }

    pub fn driver(&self) -> Option<&'static dyn FirewallDriver> {
        match self {
            Backend::None => None,
            Backend::Firewalld => Some(&firewalld::Firewalld),
            Backend::Ufw => Some(&ufw::Ufw),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Backend::None)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command vocabulary of one backend.
///
/// Drivers are pure: they build [`CommandSpec`]s and parse text, and never
/// run anything themselves.
pub trait FirewallDriver: Send + Sync {
    fn backend(&self) -> Backend;

    /// Query telling whether this backend is active.
    fn probe(&self) -> CommandSpec;
    fn probe_active(&self, output: &CommandOutput) -> bool;

    /// Stage an allow rule for `port`.
    fn allow(&self, port: Port) -> CommandSpec;
    /// Stage removal of the allow rule for `port`, if the backend can.
    fn revoke(&self, port: Port) -> Option<CommandSpec>;
    /// Make staged changes effective. `None` when changes apply immediately.
    fn commit(&self) -> Option<CommandSpec>;
    /// Whether one rule can be removed without touching the others.
    fn selective_removal(&self) -> bool;

    fn list(&self) -> CommandSpec;
    fn parse_listing(&self, listing: &str) -> RuleSet;
    /// Human-readable verbose status
    fn status(&self) -> CommandSpec;

    /// Drop every rule.
    fn wipe(&self) -> Vec<CommandSpec>;
    /// Default deny incoming, allow outgoing.
    fn baseline(&self) -> Vec<CommandSpec>;
    /// Turn filtering on after a wipe or a fresh install.
    fn enable(&self) -> Vec<CommandSpec>;

    /// Distribution package providing the backend
    fn package(&self) -> &'static str;
    /// Service activation right after the package is installed.
    fn activate(&self) -> Vec<CommandSpec>;
}

/// Probes backends in priority order and returns the first active one.
pub async fn probe_backend(runner: &dyn CommandRunner) -> Backend {
    for backend in Backend::PRIORITY {
        let Some(driver) = backend.driver() else {
            continue;
        };
        match runner.run(&driver.probe()).await {
            Ok(output) if driver.probe_active(&output) => return backend,
            Ok(_) => debug!("{backend} is not active"),
            Err(e) => debug!("{backend} probe failed: {e}"),
        }
    }
    Backend::None
}

pub struct FirewallAdapter {
    runner: Arc<dyn CommandRunner>,
    backend: Backend,
}

impl FirewallAdapter {
    /// An adapter with an already known backend.
    pub fn new(runner: Arc<dyn CommandRunner>, backend: Backend) -> Self {
        Self { runner, backend }
    }

    /// Probes the host once and caches the result.
    pub async fn detect(runner: Arc<dyn CommandRunner>) -> Self {
        let backend = probe_backend(runner.as_ref()).await;
        match backend {
            Backend::None => warn!("No active firewall backend detected"),
            other => info!("Firewall backend: {other}"),
        }
        Self::new(runner, backend)
    }

    /// The cached backend.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Probes the host again without touching the cached backend.
    pub async fn probe(&self) -> Backend {
        probe_backend(self.runner.as_ref()).await
    }

    pub(crate) fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub(crate) fn set_backend(&mut self, backend: Backend) {
        self.backend = backend;
    }

    pub fn driver(&self) -> GuardResult<&'static dyn FirewallDriver> {
        self.backend.driver().ok_or(GuardError::BackendUnavailable)
    }

    pub(crate) async fn execute(&self, spec: &CommandSpec) -> GuardResult<()> {
        run_checked(self.runner.as_ref(), spec).await.map(|_| ())
    }

    async fn execute_all(&self, specs: &[CommandSpec]) -> GuardResult<()> {
        for spec in specs {
            self.execute(spec).await?;
        }
        Ok(())
    }

    pub(crate) async fn stage_allow(&self, port: Port) -> GuardResult<()> {
        let driver = self.driver()?;
        self.execute(&driver.allow(port)).await
    }

    pub(crate) async fn stage_revoke(&self, port: Port) -> GuardResult<()> {
        let driver = self.driver()?;
        match driver.revoke(port) {
            Some(spec) => self.execute(&spec).await,
            None => Err(GuardError::Command {
                command: format!("revoke {port}"),
                reason: format!("{} cannot remove single rules", driver.backend()),
            }),
        }
    }

    pub(crate) async fn commit(&self) -> GuardResult<()> {
        match self.driver()?.commit() {
            Some(spec) => self.execute(&spec).await,
            None => Ok(()),
        }
    }

    /// Wipes every rule and reapplies the default policy.
    pub(crate) async fn reset_to_baseline(&self) -> GuardResult<()> {
        let driver = self.driver()?;
        self.execute_all(&driver.wipe()).await?;
        self.execute_all(&driver.baseline()).await
    }

    pub(crate) async fn enable(&self) -> GuardResult<()> {
        let driver = self.driver()?;
        self.execute_all(&driver.enable()).await
    }

    /// Allows `port` and makes it effective. False when there is no backend
    /// or the backend refused.
    pub async fn add_rule(&self, port: Port) -> bool {
        if !self.backend.is_active() {
            return false;
        }
        match self.stage_allow(port).await {
            Ok(()) => self.commit().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Removes the allow rule for `port` and makes it effective.
    pub async fn remove_rule(&self, port: Port) -> bool {
        if !self.backend.is_active() {
            return false;
        }
        match self.stage_revoke(port).await {
            Ok(()) => self.commit().await.is_ok(),
            Err(_) => false,
        }
    }

    /// The rules the backend currently reports.
    ///
    /// A failed listing is [`GuardError::UnknownRuleState`], never an empty
    /// set.
    pub async fn list_rules(&self) -> GuardResult<RuleSet> {
        let driver = self.driver()?;
        match run_checked(self.runner.as_ref(), &driver.list()).await {
            Ok(output) => Ok(driver.parse_listing(&output.stdout)),
            Err(e) => Err(GuardError::UnknownRuleState {
                backend: self.backend,
                reason: e.to_string(),
            }),
        }
    }

    /// Verbose status text from the backend.
    pub async fn status_report(&self) -> GuardResult<String> {
        let driver = self.driver()?;
        let output = run_checked(self.runner.as_ref(), &driver.status()).await?;
        Ok(output.stdout)
    }
}
