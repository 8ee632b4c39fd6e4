//! Network-aware two-partition queue.
//!
//! Holders are partitioned at insert time by "requires network right now".
//! The predicate is time-varying (a fallback timeout makes a gated job
//! ungated), so reads re-evaluate it for the candidate heads and migrate
//! stale entries before retrying, looping to a fixed point under a hard
//! iteration cap.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::cancel::TagQuery;
use crate::constraint::Constraint;
use crate::holder::{JobHolder, JobId, SessionId};
use crate::network::NetworkRequirement;

use super::job_set::{JobSet, RankKey, count_ready_collapsed};

/// Upper bound on migrate-and-retry passes per read.
const MIGRATION_CAP: usize = 8;

#[derive(Debug)]
pub(crate) struct MergedQueue {
    session: SessionId,
    /// Holders whose network requirement is still in force.
    gated: JobSet,
    /// Holders runnable without connectivity.
    ungated: JobSet,
    next_order: u64,
}

fn requires_network(holder: &JobHolder, now: DateTime<Utc>) -> bool {
    holder.requires_network_at(now) != NetworkRequirement::None
}

/// Merge comparator: a holder whose delay has not elapsed ranks strictly
/// below one that is due; within the same due-ness, the usual ranking
/// applies.
fn better<'a>(
    a: &'a JobHolder,
    b: &'a JobHolder,
    now: DateTime<Utc>,
) -> &'a JobHolder {
    match (a.is_due(now), b.is_due(now)) {
        (true, false) => a,
        (false, true) => b,
        _ => match RankKey::of(a).cmp(&RankKey::of(b)) {
            Ordering::Greater => b,
            _ => a,
        },
    }
}

impl MergedQueue {
    pub(crate) fn new(session: SessionId) -> Self {
        Self {
            session,
            gated: JobSet::new(),
            ungated: JobSet::new(),
            next_order: 1,
        }
    }

    pub(crate) fn session(&self) -> SessionId {
        self.session
    }

    fn partition_mut(&mut self, gated: bool) -> &mut JobSet {
        if gated { &mut self.gated } else { &mut self.ungated }
    }

    pub(crate) fn insert(&mut self, mut holder: JobHolder) {
        holder.insertion_order = self.next_order;
        self.next_order += 1;
        self.insert_classified(holder, Utc::now());
    }

    /// Re-insert after a retry: clears the claim marker and keeps the
    /// original insertion order when one was already assigned.
    pub(crate) fn insert_or_replace(&mut self, mut holder: JobHolder) {
        self.remove(holder.id);
        holder.clear_running_session();
        if holder.insertion_order == 0 {
            holder.insertion_order = self.next_order;
            self.next_order += 1;
        }
        self.insert_classified(holder, Utc::now());
    }

    fn insert_classified(&mut self, holder: JobHolder, now: DateTime<Utc>) {
        let gated = requires_network(&holder, now);
        self.partition_mut(gated).insert(holder);
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<JobHolder> {
        self.ungated.remove(id).or_else(|| self.gated.remove(id))
    }

    pub(crate) fn get(&self, id: JobId) -> Option<&JobHolder> {
        self.ungated.get(id).or_else(|| self.gated.get(id))
    }

    /// Move a holder whose classification went stale to the other side.
    fn migrate(&mut self, id: JobId, from_gated: bool) {
        if let Some(holder) = self.partition_mut(from_gated).remove(id) {
            self.partition_mut(!from_gated).insert(holder);
        }
    }

    /// Id of the best admissible holder, reconciling stale partitions
    /// first. Loops until both candidate heads are correctly classified.
    fn peek_reconciled(&mut self, constraint: &Constraint) -> Option<JobId> {
        for _ in 0..MIGRATION_CAP {
            let now = constraint.now;

            let gated_head =
                self.gated.peek_best(constraint, self.session).map(|h| {
                    (h.id, requires_network(h, now))
                });
            if let Some((id, still_gated)) = gated_head
                && !still_gated
            {
                self.migrate(id, true);
                continue;
            }

            let ungated_head =
                self.ungated.peek_best(constraint, self.session).map(|h| {
                    (h.id, requires_network(h, now))
                });
            if let Some((id, now_gated)) = ungated_head
                && now_gated
            {
                self.migrate(id, false);
                continue;
            }

            return match (gated_head, ungated_head) {
                (Some((a, _)), Some((b, _))) => {
                    let ha = self.gated.get(a).expect("peeked holder");
                    let hb = self.ungated.get(b).expect("peeked holder");
                    Some(better(ha, hb, now).id)
                }
                (Some((a, _)), None) => Some(a),
                (None, Some((b, _))) => Some(b),
                (None, None) => None,
            };
        }
        warn!(
            cap = MIGRATION_CAP,
            "merged queue classification did not settle, returning none"
        );
        None
    }

    /// Claim the best admissible holder: assigns the session, increments
    /// the run count, and returns a clone. The holder stays in its
    /// partition until removed or re-queued.
    pub(crate) fn claim_best(
        &mut self,
        constraint: &Constraint,
    ) -> Option<JobHolder> {
        let id = self.peek_reconciled(constraint)?;
        let session = self.session;
        let holder = self
            .ungated
            .get_mut(id)
            .or_else(|| self.gated.get_mut(id))?;
        holder.running_session = Some(session);
        holder.run_count += 1;
        Some(holder.clone())
    }

    pub(crate) fn count_not_running(&self) -> usize {
        self.ungated.count_not_running(self.session)
            + self.gated.count_not_running(self.session)
    }

    pub(crate) fn count_ready(&self, constraint: &Constraint) -> usize {
        let mut seen_groups = HashSet::new();
        count_ready_collapsed(
            self.ungated.iter_ranked(),
            constraint,
            self.session,
            &mut seen_groups,
        ) + count_ready_collapsed(
            self.gated.iter_ranked(),
            constraint,
            self.session,
            &mut seen_groups,
        )
    }

    pub(crate) fn next_admissible_at(
        &self,
        constraint: &Constraint,
    ) -> Option<DateTime<Utc>> {
        let a = self.ungated.next_admissible_at(constraint, self.session);
        let b = self.gated.next_admissible_at(constraint, self.session);
        match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (x, None) | (None, x) => x,
        }
    }

    pub(crate) fn find_tagged(&self, query: &TagQuery) -> Vec<JobHolder> {
        self.ungated
            .find_tagged(query)
            .chain(self.gated.find_tagged(query))
            .cloned()
            .collect()
    }

    pub(crate) fn mark_cancelled(&mut self, id: JobId) -> bool {
        self.ungated.mark_cancelled(id) || self.gated.mark_cancelled(id)
    }

    pub(crate) fn clear(&mut self) {
        self.ungated.clear();
        self.gated.clear();
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
    use crate::network::NetworkStatus;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn run(&self, _ctx: RunContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn queue() -> MergedQueue {
        MergedQueue::new(SessionId::new())
    }

    fn add(queue: &mut MergedQueue, params: JobParams) -> JobId {
        let holder = JobHolder::new(Arc::new(Noop), &params, Utc::now());
        let id = holder.id;
        queue.insert(holder);
        id
    }

    fn constraint(status: NetworkStatus) -> Constraint {
        Constraint::unexcluded(Utc::now(), status)
    }

    #[test]
    fn claims_across_partitions_in_priority_order() {
        let mut q = queue();
        let plain = add(&mut q, JobParams::new(1));
        let gated = add(&mut q, JobParams::new(5).requires_network());

        let c = constraint(NetworkStatus::Metered);
        assert_eq!(q.claim_best(&c).unwrap().id, gated);
        assert_eq!(q.claim_best(&c).unwrap().id, plain);
        assert!(q.claim_best(&c).is_none());
    }

    #[test]
    fn offline_skips_gated_partition() {
        let mut q = queue();
        let plain = add(&mut q, JobParams::new(1));
        add(&mut q, JobParams::new(9).requires_network());

        let c = constraint(NetworkStatus::Disconnected);
        assert_eq!(q.claim_best(&c).unwrap().id, plain);
        assert!(q.claim_best(&c).is_none());
    }

    #[test]
    fn lapsed_requirement_migrates_to_ungated() {
        let mut q = queue();
        let gated = add(
            &mut q,
            JobParams::new(3)
                .requires_network()
                .network_fallback_after(Duration::from_millis(1)),
        );

        let mut c = constraint(NetworkStatus::Disconnected);
        c.now += ChronoDuration::seconds(1);
        let claimed = q.claim_best(&c).unwrap();
        assert_eq!(claimed.id, gated);
        assert_eq!(claimed.run_count, 1);
        // The holder physically moved during reconciliation.
        assert!(q.ungated.contains(gated));
        assert!(!q.gated.contains(gated));
    }

    #[test]
    fn due_job_beats_delayed_higher_priority() {
        let mut q = queue();
        let delayed = add(
            &mut q,
            JobParams::new(9)
                .delayed_by(Duration::from_secs(60))
                .run_by(Duration::from_secs(1)),
        );
        let due = add(&mut q, JobParams::new(1));

        // Past the run-by deadline both are admissible, but the delayed one
        // is still not due; the due job wins despite lower priority.
        let mut c = constraint(NetworkStatus::Unmetered);
        c.now += ChronoDuration::seconds(2);
        assert_eq!(q.claim_best(&c).unwrap().id, due);
        assert_eq!(q.claim_best(&c).unwrap().id, delayed);
    }

    #[test]
    fn claim_marks_running_and_increments_run_count() {
        let mut q = queue();
        let id = add(&mut q, JobParams::new(0));
        let c = constraint(NetworkStatus::Unmetered);

        let claimed = q.claim_best(&c).unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.run_count, 1);
        assert_eq!(claimed.running_session, Some(q.session()));

        // Claimed holders are excluded from further claims and counts.
        assert!(q.claim_best(&c).is_none());
        assert_eq!(q.count_not_running(), 0);
        assert_eq!(q.count_ready(&c), 0);
    }

    #[test]
    fn insert_or_replace_requeues_for_another_claim() {
        let mut q = queue();
        let id = add(&mut q, JobParams::new(0));
        let c = constraint(NetworkStatus::Unmetered);

        let mut claimed = q.claim_best(&c).unwrap();
        claimed.clear_running_session();
        q.insert_or_replace(claimed);

        let again = q.claim_best(&c).unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.run_count, 2);
    }

    #[test]
    fn find_and_remove_probe_both_partitions() {
        let mut q = queue();
        let gated =
            add(&mut q, JobParams::new(0).requires_network().tagged(["t"]));
        let plain = add(&mut q, JobParams::new(0).tagged(["t"]));

        let found = q.find_tagged(&TagQuery::any(["t"]));
        assert_eq!(found.len(), 2);

        assert!(q.remove(gated).is_some());
        assert!(q.remove(plain).is_some());
        assert!(q.remove(plain).is_none());
    }
}
