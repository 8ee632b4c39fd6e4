//! Network availability model and the monitor collaborator.
//!
//! The engine never talks to the platform itself; it asks a
//! [`NetworkMonitor`] for the current ceiling and, when the monitor supports
//! push, re-evaluates idle consumers as soon as the ceiling changes.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connectivity ceiling reported by the platform, totally ordered.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum NetworkStatus {
    /// No connectivity at all.
    #[default]
    Disconnected,
    /// Connected through a metered link.
    Metered,
    /// Connected through an unmetered link.
    Unmetered,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Disconnected => write!(f, "disconnected"),
            NetworkStatus::Metered => write!(f, "metered"),
            NetworkStatus::Unmetered => write!(f, "unmetered"),
        }
    }
}

/// What a job demands from the network before it may run.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum NetworkRequirement {
    /// Runs regardless of connectivity.
    #[default]
    None,
    /// Needs any connection, metered is fine.
    Connected,
    /// Needs an unmetered connection.
    Unmetered,
}

impl NetworkRequirement {
    /// Whether `status` satisfies this requirement.
    pub fn satisfied_by(self, status: NetworkStatus) -> bool {
        match self {
            NetworkRequirement::None => true,
            NetworkRequirement::Connected => status >= NetworkStatus::Metered,
            NetworkRequirement::Unmetered => {
                status >= NetworkStatus::Unmetered
            }
        }
    }
}

/// Supplies the current network ceiling and optional push notifications.
///
/// `watch` returns a receiver seeded with the current status; monitors that
/// cannot push simply never update it. The engine polls `status` when
/// building constraints, so a pull-only monitor is fully functional.
pub trait NetworkMonitor: Send + Sync {
    /// Current ceiling, queried per scheduling decision.
    fn status(&self) -> NetworkStatus;

    /// Change notifications; the engine reacts without waiting for a timer.
    fn watch(&self) -> watch::Receiver<NetworkStatus>;
}

/// In-process monitor driven by explicit [`set`](ManualNetworkMonitor::set)
/// calls. The default collaborator (always unmetered) and the test vehicle.
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl ManualNetworkMonitor {
    /// Monitor starting at `status`.
    pub fn new(status: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self { tx }
    }

    /// Monitor that always reports an unmetered connection.
    pub fn unmetered() -> Self {
        Self::new(NetworkStatus::Unmetered)
    }

    /// Update the reported ceiling, notifying all watchers.
    pub fn set(&self, status: NetworkStatus) {
        // send_replace never fails; the sender keeps the value alive even
        // with no receivers subscribed.
        self.tx.send_replace(status);
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::unmetered()
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}
