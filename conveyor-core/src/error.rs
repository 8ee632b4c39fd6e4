use thiserror::Error;

use crate::holder::JobId;

/// Errors surfaced by the queue engine.
#[derive(Error, Debug)]
pub enum ConveyorError {
    /// The backing store rejected or failed an operation. The affected job
    /// was not silently dropped; the caller owns the retry decision.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// A durable record could not be decoded back into a runnable job.
    #[error("job payload decode failed: {0}")]
    Decode(String),

    /// The job is not known to any queue owned by this manager.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The manager has been stopped and no longer hands out work.
    #[error("manager is stopped")]
    Stopped,

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ConveyorError>;
