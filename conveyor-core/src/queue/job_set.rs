//! Ranked in-memory holder set with id and tag indexes.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::cancel::TagQuery;
use crate::constraint::Constraint;
use crate::holder::{JobHolder, JobId, SessionId};

/// Ordering key: priority descending, creation time ascending, insertion
/// order ascending. Insertion orders are unique within a queue, so the key
/// is unique and usable as a map key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RankKey {
    priority: i32,
    created_at: DateTime<Utc>,
    insertion_order: u64,
}

impl RankKey {
    pub(crate) fn of(holder: &JobHolder) -> Self {
        Self {
            priority: holder.priority,
            created_at: holder.created_at,
            insertion_order: holder.insertion_order,
        }
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.insertion_order.cmp(&other.insertion_order))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct JobSet {
    ranked: BTreeMap<RankKey, JobHolder>,
    by_id: HashMap<JobId, RankKey>,
}

impl JobSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.ranked.len()
    }

    pub(crate) fn insert(&mut self, holder: JobHolder) {
        let key = RankKey::of(&holder);
        if let Some(old_key) = self.by_id.insert(holder.id, key.clone()) {
            self.ranked.remove(&old_key);
        }
        self.ranked.insert(key, holder);
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<JobHolder> {
        let key = self.by_id.remove(&id)?;
        self.ranked.remove(&key)
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub(crate) fn get(&self, id: JobId) -> Option<&JobHolder> {
        self.ranked.get(self.by_id.get(&id)?)
    }

    /// Mutable access; callers must not touch fields that feed [`RankKey`].
    pub(crate) fn get_mut(&mut self, id: JobId) -> Option<&mut JobHolder> {
        self.ranked.get_mut(self.by_id.get(&id)?)
    }

    /// Holders in ranking order.
    pub(crate) fn iter_ranked(
        &self,
    ) -> impl Iterator<Item = &JobHolder> + '_ {
        self.ranked.values()
    }

    /// Best-ranked holder admissible under `constraint`.
    pub(crate) fn peek_best(
        &self,
        constraint: &Constraint,
        session: SessionId,
    ) -> Option<&JobHolder> {
        self.ranked.values().find(|h| {
            constraint.admits(h, h.running_session == Some(session))
        })
    }

    /// Earliest future admissibility instant across blocked holders.
    pub(crate) fn next_admissible_at(
        &self,
        constraint: &Constraint,
        session: SessionId,
    ) -> Option<DateTime<Utc>> {
        self.ranked
            .values()
            .filter(|h| {
                !(constraint.exclude_running
                    && h.running_session == Some(session))
            })
            .filter_map(|h| constraint.admissible_at(h))
            .min()
    }

    /// Non-cancelled holders matching a tag query, running or not.
    pub(crate) fn find_tagged<'a>(
        &'a self,
        query: &'a TagQuery,
    ) -> impl Iterator<Item = &'a JobHolder> + 'a {
        self.ranked
            .values()
            .filter(|h| !h.cancelled)
            .filter(move |h| query.matches(&h.tags))
    }

    pub(crate) fn mark_cancelled(&mut self, id: JobId) -> bool {
        match self.get_mut(id) {
            Some(holder) => {
                holder.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn count_not_running(&self, session: SessionId) -> usize {
        self.ranked
            .values()
            .filter(|h| h.running_session != Some(session))
            .count()
    }

    pub(crate) fn clear(&mut self) {
        self.ranked.clear();
        self.by_id.clear();
    }
}

impl std::fmt::Debug for JobSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSet").field("len", &self.len()).finish()
    }
}

/// Group-collapsed ready count over an iterator of ranked holders.
///
/// Same-group holders collapse to a single actionable slot; the
/// `seen_groups` set is shared so the collapse spans partitions.
pub(crate) fn count_ready_collapsed<'a>(
    holders: impl Iterator<Item = &'a JobHolder>,
    constraint: &Constraint,
    session: SessionId,
    seen_groups: &mut HashSet<String>,
) -> usize {
    holders
        .filter(|h| constraint.admits(h, h.running_session == Some(session)))
        .filter(|h| match &h.group_id {
            Some(group) => seen_groups.insert(group.clone()),
            None => true,
        })
        .count()
}
