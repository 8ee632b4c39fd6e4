//! Advisory OS-level wake-up collaborator.
//!
//! Platforms with a deferred-execution scheduler can arrange for the
//! process to be revived around the time gated work becomes admissible.
//! Purely advisory: while the process is alive the manager's own timer is
//! authoritative.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::network::NetworkRequirement;

/// Receives hints about the earliest future admissibility the engine knows
/// about.
#[async_trait]
pub trait SchedulingBackstop: Send + Sync {
    /// Ask the platform to wake this process at or after `at`, ideally once
    /// `requirement` is satisfiable.
    async fn request_wakeup(
        &self,
        at: DateTime<Utc>,
        requirement: NetworkRequirement,
    );

    /// Drop all outstanding wake-up requests.
    async fn cancel_all(&self);
}

/// Default collaborator for platforms without a scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopBackstop;

#[async_trait]
impl SchedulingBackstop for NoopBackstop {
    async fn request_wakeup(
        &self,
        _at: DateTime<Utc>,
        _requirement: NetworkRequirement,
    ) {
    }

    async fn cancel_all(&self) {}
}
