//! Queue-internal job wrapper carrying all scheduling state.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{DeadlineBehavior, Job, JobParams};
use crate::network::NetworkRequirement;

/// Unique identifier assigned to a job at construction, independent of the
/// backing store.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
    PartialOrd, Ord,
)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one manager incarnation. A durable holder claimed under a
/// different session belongs to a crashed prior run and counts as ready.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Fresh session id for a new manager incarnation.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job plus the scheduling metadata the queues operate on.
///
/// The holder owns the job exclusively while queued; claims hand out clones
/// whose `Arc<dyn Job>` shares the same underlying job. `running_session`
/// doubles as the claimed marker: `None` is the "not running" sentinel.
#[derive(Clone)]
pub struct JobHolder {
    /// Stable job identity.
    pub id: JobId,
    /// The executable payload; opaque to the engine.
    pub job: Arc<dyn Job>,
    /// Higher runs first.
    pub priority: i32,
    /// Sequential-execution group, if any.
    pub group_id: Option<String>,
    /// Single-instance id, if any (also present as a reserved tag).
    pub single_instance_id: Option<String>,
    /// User tags plus the reserved single-instance tag.
    pub tags: Arc<HashSet<String>>,
    /// Whether the holder belongs to the durable queue.
    pub persistent: bool,
    /// Connectivity needed before the job may run.
    pub requirement: NetworkRequirement,
    /// Instant after which the network requirement lapses.
    pub requirement_lapses_at: Option<DateTime<Utc>>,
    /// Enqueue timestamp; ranking tie-break after priority.
    pub created_at: DateTime<Utc>,
    /// Inadmissible before this instant.
    pub delay_until: Option<DateTime<Utc>>,
    /// Absolute run-by or cancel-by bound.
    pub deadline_at: Option<DateTime<Utc>>,
    /// How `deadline_at` resolves.
    pub deadline_behavior: DeadlineBehavior,
    /// Maximum dequeues before terminal cancellation.
    pub retry_limit: u32,
    /// Dequeue counter, incremented by every claim.
    pub run_count: u32,
    /// Monotonic per-queue counter; final ranking tie-break.
    pub insertion_order: u64,
    /// Session currently holding the job, `None` when not running.
    pub running_session: Option<SessionId>,
    /// Marked by a cancel request; excluded from queries until removed.
    pub cancelled: bool,
}

impl JobHolder {
    /// Wrap `job` for insertion, resolving relative times against `now`.
    pub fn new(job: Arc<dyn Job>, params: &JobParams, now: DateTime<Utc>) -> Self {
        let delay_until = params
            .delay
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| now + d);
        let deadline_at = params
            .deadline
            .and_then(|d| ChronoDuration::from_std(d.after).ok())
            .map(|d| now + d);
        let requirement_lapses_at = params
            .requirement_fallback
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| now + d);

        Self {
            id: JobId::new(),
            job,
            priority: params.priority,
            group_id: params.group_id.clone(),
            single_instance_id: params.single_instance_id.clone(),
            tags: Arc::new(params.effective_tags()),
            persistent: params.persistent,
            requirement: params.requirement,
            requirement_lapses_at,
            created_at: now,
            delay_until,
            deadline_at,
            deadline_behavior: params
                .deadline
                .map(|d| d.behavior)
                .unwrap_or_default(),
            retry_limit: params.retry_limit,
            run_count: 0,
            insertion_order: 0,
            running_session: None,
            cancelled: false,
        }
    }

    /// Effective network requirement at `now`, honoring the fallback lapse.
    pub fn requires_network_at(
        &self,
        now: DateTime<Utc>,
    ) -> NetworkRequirement {
        match self.requirement_lapses_at {
            Some(lapse) if lapse <= now => NetworkRequirement::None,
            _ => self.requirement,
        }
    }

    /// Whether the delay block has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delay_until.is_none_or(|t| t <= now)
    }

    /// Whether the deadline (of either behavior) has passed.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|t| t <= now)
    }

    /// Whether a passed deadline should terminally cancel instead of run.
    pub fn deadline_cancels(&self, now: DateTime<Utc>) -> bool {
        self.deadline_passed(now)
            && self.deadline_behavior == DeadlineBehavior::Cancel
    }

    /// Reset the claim marker ahead of a retry re-queue.
    pub fn clear_running_session(&mut self) {
        self.running_session = None;
    }
}

impl fmt::Debug for JobHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHolder")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("group_id", &self.group_id)
            .field("single_instance_id", &self.single_instance_id)
            .field("tags", &self.tags)
            .field("persistent", &self.persistent)
            .field("requirement", &self.requirement)
            .field("created_at", &self.created_at)
            .field("delay_until", &self.delay_until)
            .field("deadline_at", &self.deadline_at)
            .field("run_count", &self.run_count)
            .field("insertion_order", &self.insertion_order)
            .field("running_session", &self.running_session)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::RunContext;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn run(&self, _ctx: RunContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn relative_times_resolve_against_now() {
        let now = Utc::now();
        let params = JobParams::new(1)
            .delayed_by(Duration::from_secs(10))
            .run_by(Duration::from_secs(60))
            .requires_network()
            .network_fallback_after(Duration::from_secs(30));
        let holder = JobHolder::new(Arc::new(Noop), &params, now);

        assert_eq!(
            holder.delay_until,
            Some(now + ChronoDuration::seconds(10))
        );
        assert_eq!(
            holder.deadline_at,
            Some(now + ChronoDuration::seconds(60))
        );
        assert!(!holder.is_due(now));
        assert!(holder.is_due(now + ChronoDuration::seconds(10)));
    }

    #[test]
    fn network_requirement_lapses_after_fallback() {
        let now = Utc::now();
        let params = JobParams::new(0)
            .requires_unmetered_network()
            .network_fallback_after(Duration::from_secs(5));
        let holder = JobHolder::new(Arc::new(Noop), &params, now);

        assert_eq!(
            holder.requires_network_at(now),
            NetworkRequirement::Unmetered
        );
        assert_eq!(
            holder.requires_network_at(now + ChronoDuration::seconds(5)),
            NetworkRequirement::None
        );
    }
}
