//! Storage-agnostic queue contract and the in-memory implementation.
//!
//! Two queue instances back one manager: a durable queue (any
//! implementation of [`JobQueue`], e.g. `conveyor-sqlite`) and an in-memory
//! queue. The manager merges the two into one logical ordered set.

mod job_set;
mod memory;
mod merged;

pub use memory::MemoryJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cancel::TagQuery;
use crate::constraint::Constraint;
use crate::error::Result;
use crate::holder::{JobHolder, JobId};

/// Ordered collection of job holders supporting constrained retrieval.
///
/// Ranking for claims and ready counts: priority descending, then creation
/// time ascending, then insertion order ascending. Implementations assign
/// the insertion order on `insert` and interpret "running" as "claimed by
/// the session this queue was constructed for"; holders claimed by a stale
/// session (a crashed prior incarnation) count as ready again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store a holder, assigning its insertion order. Fails only on storage
    /// errors; the job is never silently dropped.
    async fn insert(&self, holder: JobHolder) -> Result<()>;

    /// Idempotent re-insert used after a retry decision. Clears the running
    /// session marker and preserves the holder's original insertion order.
    async fn insert_or_replace(&self, holder: JobHolder) -> Result<()>;

    /// Delete by id; no-op if absent.
    async fn remove(&self, id: JobId) -> Result<()>;

    /// Number of holders not claimed by the current session.
    async fn count(&self) -> Result<usize>;

    /// Number of claimable holders under `constraint`, counting each group
    /// once (group exclusivity leaves one actionable slot per group).
    async fn count_ready(&self, constraint: &Constraint) -> Result<usize>;

    /// Atomically select, mark running, and return the best-ranked
    /// admissible holder: the claim assigns the current session id and
    /// increments the run count.
    async fn next_job_and_inc_run_count(
        &self,
        constraint: &Constraint,
    ) -> Result<Option<JobHolder>>;

    /// Earliest instant at which some currently-blocked holder becomes
    /// admissible, honoring delay/network/deadline conditions but ignoring
    /// the in-flight exclusion sets. Feeds the wake-up timer.
    async fn next_job_delay_until(
        &self,
        constraint: &Constraint,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Tag-based lookup over non-cancelled holders, running or not.
    async fn find_jobs(&self, query: &TagQuery) -> Result<Vec<JobHolder>>;

    /// Mark a holder cancelled-but-not-yet-removed so subsequent queries
    /// skip it until `remove` runs.
    async fn on_job_cancelled(&self, id: JobId) -> Result<()>;

    /// Drop every holder.
    async fn clear(&self) -> Result<()>;
}
