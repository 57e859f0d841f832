//! portguard: port discovery and firewall reconciliation.
//!
//! Keeps a host's firewall limited to the ports its services need: SSH plus
//! the listeners of known proxy daemons. [`ops::PortGuard`] is the entry
//! point used by the daemon.

pub mod discovery;
pub mod error;
pub mod events;
pub mod exec;
pub mod firewall;
pub mod host;
pub mod lockdown;
pub mod monitor;
pub mod ops;
pub mod reconcile;
pub mod rules;
pub mod settings;
pub mod testing;

pub use error::{GuardError, GuardResult};
pub use ops::{Operation, OperationResult, PortGuard};
