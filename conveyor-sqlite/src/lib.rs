//! SQLite-backed durable queue for the conveyor job engine.
//!
//! Jobs routed to this queue survive process restarts: holders claimed by a
//! crashed incarnation (stale session id) are handed out again as ordinary
//! ready jobs. Job payloads travel as JSON envelopes
//! ([`DurablePayload`](conveyor_core::DurablePayload)) and are decoded back
//! into runnable jobs through a [`JobRegistry`].
//!
//! ```ignore
//! let mut registry = JobRegistry::new();
//! registry.register_type::<SyncJob>("sync");
//!
//! let builder = JobManager::builder();
//! let queue =
//!     SqliteJobQueue::open(path, registry, builder.session_id()).await?;
//! let manager = builder.durable_queue(Arc::new(queue)).build();
//! ```

mod queue;
mod registry;

pub use queue::SqliteJobQueue;
pub use registry::JobRegistry;
