//! Cancellation vocabulary: reasons, tag queries, and aggregated results.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::holder::JobId;

/// Why a job was terminally dropped. Passed to
/// [`Job::on_cancel`](crate::job::Job::on_cancel) exactly once.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// The job failed and its run count reached the retry limit.
    ReachedRetryLimit,
    /// The job's own retry policy returned
    /// [`RetryDecision::Cancel`](crate::retry::RetryDecision).
    CancelledViaRetryPolicy,
    /// A cancel request matched the job while it was running and the run
    /// did not complete successfully.
    CancelledWhileRunning,
    /// A cancel request matched the job before it ever ran.
    CancelledViaRequest,
    /// Dropped at enqueue time: a job with the same single-instance id was
    /// already queued and not running.
    SingleInstanceAlreadyQueued,
    /// A queued duplicate made redundant when another job carrying the same
    /// single-instance id was claimed for execution.
    SupersededBySingleInstance,
    /// The job's cancel-by deadline passed before it could run.
    DeadlineReached,
}

/// How a set of query tags must relate to a job's tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TagMatch {
    /// At least one query tag present on the job.
    Any,
    /// Every query tag present on the job.
    All,
}

/// Tag-based lookup used by `find_jobs` and the cancel API.
#[derive(Clone, Debug)]
pub struct TagQuery {
    /// ANY/ALL semantics for `tags`.
    pub match_mode: TagMatch,
    /// Tags to match against each holder's tag set.
    pub tags: HashSet<String>,
}

impl TagQuery {
    /// Query matching jobs that carry any of `tags`.
    pub fn any<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            match_mode: TagMatch::Any,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Query matching jobs that carry all of `tags`.
    pub fn all<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            match_mode: TagMatch::All,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a holder tag set satisfies this query. Empty queries match
    /// nothing; cancelling the whole queue goes through `clear` instead.
    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        if self.tags.is_empty() {
            return false;
        }
        match self.match_mode {
            TagMatch::Any => self.tags.iter().any(|t| tags.contains(t)),
            TagMatch::All => self.tags.iter().all(|t| tags.contains(t)),
        }
    }
}

/// Outcome of one cancel request.
///
/// Every matched job lands in exactly one bucket: `cancelled` if it was
/// dropped before or while running, `failed_to_cancel` if it completed
/// successfully before the cancellation could take effect.
#[derive(Clone, Debug, Default)]
pub struct CancelResult {
    /// Jobs cancelled by this request.
    pub cancelled: Vec<JobId>,
    /// Jobs that finished successfully despite the request.
    pub failed_to_cancel: Vec<JobId>,
}

impl CancelResult {
    /// Total number of jobs the request matched.
    pub fn matched(&self) -> usize {
        self.cancelled.len() + self.failed_to_cancel.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn any_matches_single_overlap() {
        let query = TagQuery::any(["sync", "upload"]);
        assert!(query.matches(&tags(&["upload", "media"])));
        assert!(!query.matches(&tags(&["media"])));
    }

    #[test]
    fn all_requires_every_tag() {
        let query = TagQuery::all(["sync", "upload"]);
        assert!(query.matches(&tags(&["sync", "upload", "media"])));
        assert!(!query.matches(&tags(&["sync", "media"])));
    }

    #[test]
    fn empty_query_matches_nothing() {
        let query = TagQuery::any(Vec::<String>::new());
        assert!(!query.matches(&tags(&["sync"])));
    }
}
