//! Per-query admissibility constraint.
//!
//! A [`Constraint`] is built fresh from the manager's current state for
//! every scheduling decision and discarded afterwards; it has no identity
//! of its own.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::holder::{JobHolder, JobId};
use crate::network::NetworkStatus;

/// Snapshot of everything that decides whether a holder may be claimed.
#[derive(Clone, Debug)]
pub struct Constraint {
    /// Query timestamp; all time comparisons use this single instant.
    pub now: DateTime<Utc>,
    /// Current network ceiling.
    pub network_status: NetworkStatus,
    /// Exclude holders claimed by the querying session.
    pub exclude_running: bool,
    /// Groups with a job currently in flight (copy-on-write snapshot).
    pub exclude_groups: Arc<HashSet<String>>,
    /// Reserved tags of single-instance ids currently in flight.
    pub exclude_tags: Arc<HashSet<String>>,
    /// Individual holders excluded from this query.
    pub exclude_job_ids: HashSet<JobId>,
}

impl Constraint {
    /// Constraint carrying only time and network state; the in-flight
    /// exclusion sets stay empty. Used for counting and wake-up queries.
    pub fn unexcluded(
        now: DateTime<Utc>,
        network_status: NetworkStatus,
    ) -> Self {
        Self {
            now,
            network_status,
            exclude_running: true,
            exclude_groups: Arc::new(HashSet::new()),
            exclude_tags: Arc::new(HashSet::new()),
            exclude_job_ids: HashSet::new(),
        }
    }

    /// Whether `holder` may be claimed under this constraint.
    ///
    /// A passed run-by deadline waives the delay and network blocks; the
    /// running/cancelled/group/tag/id exclusions always apply. A passed
    /// cancel-by deadline also admits the holder so a worker claims it and
    /// resolves the cancellation.
    pub fn admits(&self, holder: &JobHolder, session_running: bool) -> bool {
        if holder.cancelled {
            return false;
        }
        if self.exclude_running && session_running {
            return false;
        }
        if self.exclude_job_ids.contains(&holder.id) {
            return false;
        }
        if let Some(group) = &holder.group_id
            && self.exclude_groups.contains(group)
        {
            return false;
        }
        if !self.exclude_tags.is_empty()
            && holder.tags.iter().any(|t| self.exclude_tags.contains(t))
        {
            return false;
        }

        if holder.deadline_passed(self.now) {
            return true;
        }

        holder.is_due(self.now)
            && holder
                .requires_network_at(self.now)
                .satisfied_by(self.network_status)
    }

    /// Earliest instant at/after `now` when `holder` could satisfy the
    /// time- and network-dependent checks, assuming the network ceiling
    /// stays at `network_status`. `None` means only a network change (or
    /// nothing at all) can unblock it.
    ///
    /// In-flight exclusions (groups, tags, ids) are deliberately ignored:
    /// this feeds the wake-up timer, which only cares about conditions a
    /// timer can outwait.
    pub fn admissible_at(&self, holder: &JobHolder) -> Option<DateTime<Utc>> {
        if holder.cancelled {
            return None;
        }

        let due_at = match holder.delay_until {
            Some(t) if t > self.now => t,
            _ => self.now,
        };

        let network_ok_at = if holder
            .requires_network_at(self.now)
            .satisfied_by(self.network_status)
        {
            Some(self.now)
        } else {
            // Unsatisfiable until the requirement lapses.
            holder.requirement_lapses_at
        };

        let unblocked_at = network_ok_at.map(|n| due_at.max(n));

        // A deadline unblocks regardless of the other conditions.
        match (unblocked_at, holder.deadline_at) {
            (Some(a), Some(d)) => Some(a.min(d)),
            (Some(a), None) => Some(a),
            (None, Some(d)) => Some(d),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::job::{Job, JobParams, RunContext};

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn run(&self, _ctx: RunContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn holder(params: JobParams) -> JobHolder {
        JobHolder::new(Arc::new(Noop), &params, Utc::now())
    }

    fn constraint(status: NetworkStatus) -> Constraint {
        Constraint::unexcluded(Utc::now(), status)
    }

    #[test]
    fn delay_blocks_until_due() {
        let h = holder(JobParams::new(0).delayed_by(Duration::from_secs(30)));
        let c = constraint(NetworkStatus::Unmetered);
        assert!(!c.admits(&h, false));

        let mut later = c.clone();
        later.now += ChronoDuration::seconds(31);
        assert!(later.admits(&h, false));
    }

    #[test]
    fn network_requirement_blocks_below_ceiling() {
        let h = holder(JobParams::new(0).requires_unmetered_network());
        assert!(!constraint(NetworkStatus::Metered).admits(&h, false));
        assert!(constraint(NetworkStatus::Unmetered).admits(&h, false));
    }

    #[test]
    fn passed_run_by_deadline_overrides_delay_and_network() {
        let h = holder(
            JobParams::new(0)
                .delayed_by(Duration::from_secs(3600))
                .requires_network()
                .run_by(Duration::from_secs(1)),
        );
        let mut c = constraint(NetworkStatus::Disconnected);
        c.now += ChronoDuration::seconds(2);
        assert!(c.admits(&h, false));
    }

    #[test]
    fn deadline_does_not_override_group_exclusion() {
        let h = holder(JobParams::new(0).in_group("g").run_by(Duration::ZERO));
        let mut c = constraint(NetworkStatus::Unmetered);
        c.now += ChronoDuration::seconds(1);
        c.exclude_groups = Arc::new(["g".to_string()].into_iter().collect());
        assert!(!c.admits(&h, false));
    }

    #[test]
    fn running_holders_are_excluded() {
        let h = holder(JobParams::new(0));
        let c = constraint(NetworkStatus::Unmetered);
        assert!(!c.admits(&h, true));
    }

    #[test]
    fn admissible_at_prefers_earliest_unblock() {
        let c = constraint(NetworkStatus::Disconnected);

        // Network-gated with a fallback: wakes when the requirement lapses.
        let h = holder(
            JobParams::new(0)
                .requires_network()
                .network_fallback_after(Duration::from_secs(10)),
        );
        assert_eq!(c.admissible_at(&h), h.requirement_lapses_at);

        // Network-gated without fallback or deadline: timer cannot help.
        let h = holder(JobParams::new(0).requires_network());
        assert_eq!(c.admissible_at(&h), None);

        // Deadline always provides a bound.
        let h = holder(
            JobParams::new(0)
                .requires_network()
                .run_by(Duration::from_secs(5)),
        );
        assert_eq!(c.admissible_at(&h), h.deadline_at);

        // Plain delay resolves to its due time.
        let h = holder(JobParams::new(0).delayed_by(Duration::from_secs(7)));
        assert_eq!(c.admissible_at(&h), h.delay_until);
    }
}
