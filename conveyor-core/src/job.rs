//! The job contract and its scheduling parameters.
//!
//! Behavior lives on the [`Job`] trait; everything the scheduler needs to
//! order, gate, and retry the job travels separately in [`JobParams`]. The
//! engine treats the job itself as opaque.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelReason;
use crate::holder::JobId;
use crate::network::NetworkRequirement;
use crate::retry::RetryDecision;

/// Default retry limit applied when [`JobParams`] does not override it.
pub const DEFAULT_RETRY_LIMIT: u32 = 20;

/// Prefix namespacing the reserved tag that backs single-instance dedup.
const SINGLE_INSTANCE_TAG_PREFIX: &str = "conveyor:single:";

/// Reserved tag derived from a single-instance id.
pub(crate) fn single_instance_tag(id: &str) -> String {
    format!("{SINGLE_INSTANCE_TAG_PREFIX}{id}")
}

/// Handle given to a running job body.
///
/// Cancellation is cooperative only: the engine flips the token when a
/// cancel request matches a running job and otherwise never interrupts the
/// body. Long-running jobs should poll [`is_cancelled`](Self::is_cancelled)
/// or select on [`cancellation`](Self::cancellation).
#[derive(Clone, Debug)]
pub struct RunContext {
    job_id: JobId,
    run_count: u32,
    cancellation: CancellationToken,
}

impl RunContext {
    pub(crate) fn new(
        job_id: JobId,
        run_count: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            run_count,
            cancellation,
        }
    }

    /// Id of the job being executed.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Number of times this job has been dequeued, including this run.
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    /// Whether a cancel request has been issued against this run.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Token flipped when the run is cancelled; usable in `select!`.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Envelope handed to durable queue implementations.
///
/// The core never inspects `body`; a durable backend stores the envelope and
/// resolves `kind` through its decode registry when loading the row back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DurablePayload {
    /// Registry key identifying the concrete job type.
    pub kind: String,
    /// Serialized job state.
    pub body: Value,
}

impl DurablePayload {
    /// Build an envelope from any serializable job state.
    pub fn new<T: Serialize>(
        kind: impl Into<String>,
        body: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            body: serde_json::to_value(body)?,
        })
    }
}

/// A unit of deferred work.
///
/// Implementations must be cheap to share (`Arc<dyn Job>` is cloned on every
/// claim) and idempotent under at-least-once delivery.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Called synchronously once the job is committed to its queue, before
    /// any consumer can claim it. Must be fast; no blocking I/O beyond local
    /// state updates.
    fn on_added(&self) {}

    /// The actual work. Any error routes through the retry policy; a panic
    /// is contained by the worker and treated as an error.
    async fn run(&self, ctx: RunContext) -> anyhow::Result<()>;

    /// Cleanup when the job is terminally dropped. Invoked exactly once.
    async fn on_cancel(&self, _reason: CancelReason) {}

    /// Retry policy hook, consulted after each failed run while
    /// `run_count < retry_limit`. The default retries unconditionally.
    fn on_failure(
        &self,
        _error: &anyhow::Error,
        _run_count: u32,
        _retry_limit: u32,
    ) -> RetryDecision {
        RetryDecision::retry()
    }

    /// Serialized form for durable queues. Jobs routed to a durable queue
    /// without a payload are rejected at insert time.
    fn durable_payload(&self) -> Option<DurablePayload> {
        None
    }
}

/// Forwarding impl so an already-shared job (`Arc<J>`) satisfies the [`Job`]
/// bound directly, mirroring the `Arc<dyn Job>` the engine stores internally.
#[async_trait]
impl<T: Job + ?Sized> Job for Arc<T> {
    fn on_added(&self) {
        (**self).on_added()
    }

    async fn run(&self, ctx: RunContext) -> anyhow::Result<()> {
        (**self).run(ctx).await
    }

    async fn on_cancel(&self, reason: CancelReason) {
        (**self).on_cancel(reason).await
    }

    fn on_failure(
        &self,
        error: &anyhow::Error,
        run_count: u32,
        retry_limit: u32,
    ) -> RetryDecision {
        (**self).on_failure(error, run_count, retry_limit)
    }

    fn durable_payload(&self) -> Option<DurablePayload> {
        (**self).durable_payload()
    }
}

/// Which way a deadline resolves once it passes.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
pub enum DeadlineBehavior {
    /// The job becomes admissible regardless of its delay and network
    /// blocks.
    #[default]
    RunAnyway,
    /// The job is terminally cancelled with
    /// [`CancelReason::DeadlineReached`].
    Cancel,
}

/// Run-by or cancel-by bound relative to enqueue time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    /// Offset from the moment the job is added.
    pub after: Duration,
    /// Resolution once the deadline passes.
    pub behavior: DeadlineBehavior,
}

/// Scheduling metadata attached to a job at enqueue time.
///
/// Built with the fluent constructors:
///
/// ```
/// use std::time::Duration;
/// use conveyor_core::JobParams;
///
/// let params = JobParams::new(5)
///     .persist()
///     .in_group("sync")
///     .tagged(["media"])
///     .requires_network()
///     .delayed_by(Duration::from_secs(30));
/// assert_eq!(params.priority, 5);
/// assert!(params.persistent);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobParams {
    /// Higher runs first.
    pub priority: i32,
    /// Route to the durable queue instead of the in-memory queue.
    pub persistent: bool,
    /// Jobs sharing a group id run strictly sequentially.
    pub group_id: Option<String>,
    /// Deduplicates queued-but-not-running jobs.
    pub single_instance_id: Option<String>,
    /// Free-form tags for lookup and cancellation.
    pub tags: HashSet<String>,
    /// Connectivity the job needs before it may run.
    pub requirement: NetworkRequirement,
    /// After this much waiting the network requirement lapses entirely.
    pub requirement_fallback: Option<Duration>,
    /// Earliest run is `add time + delay`.
    pub delay: Option<Duration>,
    /// Run-by or cancel-by bound.
    pub deadline: Option<Deadline>,
    /// Maximum number of dequeues before terminal cancellation.
    pub retry_limit: u32,
}

impl JobParams {
    /// Parameters for a non-persistent job at `priority`.
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            persistent: false,
            group_id: None,
            single_instance_id: None,
            tags: HashSet::new(),
            requirement: NetworkRequirement::None,
            requirement_fallback: None,
            delay: None,
            deadline: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    /// Route the job to the durable queue.
    pub fn persist(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Sequence the job behind others sharing `group`.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group_id = Some(group.into());
        self
    }

    /// Deduplicate against queued jobs carrying the same id.
    pub fn single_instance(mut self, id: impl Into<String>) -> Self {
        self.single_instance_id = Some(id.into());
        self
    }

    /// Attach lookup/cancellation tags.
    pub fn tagged<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Require any network connection.
    pub fn requires_network(mut self) -> Self {
        self.requirement = self.requirement.max(NetworkRequirement::Connected);
        self
    }

    /// Require an unmetered network connection.
    pub fn requires_unmetered_network(mut self) -> Self {
        self.requirement = NetworkRequirement::Unmetered;
        self
    }

    /// Drop the network requirement after waiting `fallback`.
    pub fn network_fallback_after(mut self, fallback: Duration) -> Self {
        self.requirement_fallback = Some(fallback);
        self
    }

    /// Hold the job back for `delay` after it is added.
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Force the job admissible `after` enqueue even if still blocked.
    pub fn run_by(mut self, after: Duration) -> Self {
        self.deadline = Some(Deadline {
            after,
            behavior: DeadlineBehavior::RunAnyway,
        });
        self
    }

    /// Terminally cancel the job if it has not run within `after`.
    pub fn cancel_by(mut self, after: Duration) -> Self {
        self.deadline = Some(Deadline {
            after,
            behavior: DeadlineBehavior::Cancel,
        });
        self
    }

    /// Override the retry limit (default 20).
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Full tag set as stored on the holder: user tags plus the reserved
    /// single-instance tag.
    pub(crate) fn effective_tags(&self) -> HashSet<String> {
        let mut tags = self.tags.clone();
        if let Some(id) = &self.single_instance_id {
            tags.insert(single_instance_tag(id));
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_fields() {
        let params = JobParams::new(8)
            .persist()
            .in_group("g")
            .single_instance("fetch-profile")
            .tagged(["a", "b"])
            .requires_unmetered_network()
            .network_fallback_after(Duration::from_secs(60))
            .delayed_by(Duration::from_millis(500))
            .cancel_by(Duration::from_secs(3600))
            .retry_limit(3);

        assert_eq!(params.priority, 8);
        assert!(params.persistent);
        assert_eq!(params.group_id.as_deref(), Some("g"));
        assert_eq!(params.requirement, NetworkRequirement::Unmetered);
        assert_eq!(params.retry_limit, 3);
        assert_eq!(
            params.deadline.unwrap().behavior,
            DeadlineBehavior::Cancel
        );
    }

    #[test]
    fn effective_tags_reserve_single_instance() {
        let params = JobParams::new(0).single_instance("x").tagged(["y"]);
        let tags = params.effective_tags();
        assert!(tags.contains("y"));
        assert!(tags.contains(&single_instance_tag("x")));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn requires_network_does_not_downgrade_unmetered() {
        let params = JobParams::new(0)
            .requires_unmetered_network()
            .requires_network();
        assert_eq!(params.requirement, NetworkRequirement::Unmetered);
    }

    #[test]
    fn params_serde_roundtrip() {
        let params = JobParams::new(3)
            .tagged(["t"])
            .delayed_by(Duration::from_secs(2));
        let json = serde_json::to_string(&params).unwrap();
        let back: JobParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, 3);
        assert_eq!(back.delay, Some(Duration::from_secs(2)));
        assert!(back.tags.contains("t"));
    }
}
