//! Priority job queue engine.
//!
//! Callers enqueue units of deferred work with a priority, an optional
//! delay, network requirements, a sequencing group, and single-instance
//! deduplication; a dynamically sized consumer pool executes them with
//! bounded concurrency, per-job retry policies, and tag-based cancellation.
//!
//! Two queues back one [`JobManager`]: an in-memory queue and a durable
//! queue (any [`JobQueue`] implementation; `conveyor-sqlite` ships the
//! reference one). The manager merges both into a single ordered view.
//!
//! ```ignore
//! use conveyor_core::{Job, JobManager, JobParams, RunContext};
//!
//! struct SyncJob;
//!
//! #[async_trait::async_trait]
//! impl Job for SyncJob {
//!     async fn run(&self, _ctx: RunContext) -> anyhow::Result<()> {
//!         // ... the actual work ...
//!         Ok(())
//!     }
//! }
//!
//! let manager = JobManager::new();
//! let id = manager
//!     .add(JobParams::new(5).requires_network().in_group("sync"), SyncJob)
//!     .await?;
//! ```

mod backstop;
mod cancel;
mod config;
mod constraint;
mod consumer;
mod error;
mod events;
mod holder;
mod job;
mod manager;
mod network;
mod queue;
mod retry;

pub use backstop::{NoopBackstop, SchedulingBackstop};
pub use cancel::{CancelReason, CancelResult, TagMatch, TagQuery};
pub use config::ManagerConfig;
pub use constraint::Constraint;
pub use error::{ConveyorError, Result};
pub use events::JobEvent;
pub use holder::{JobHolder, JobId, SessionId};
pub use job::{
    DEFAULT_RETRY_LIMIT, Deadline, DeadlineBehavior, DurablePayload, Job,
    JobParams, RunContext,
};
pub use manager::{JobManager, JobManagerBuilder};
pub use network::{
    ManualNetworkMonitor, NetworkMonitor, NetworkRequirement, NetworkStatus,
};
pub use queue::{JobQueue, MemoryJobQueue};
pub use retry::RetryDecision;
