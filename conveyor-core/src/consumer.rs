//! Consumer worker loop.
//!
//! Each worker claims work from the manager, runs it with panic
//! containment, reports the outcome, and loops. Idle workers linger for the
//! keep-alive window before asking to retire, so bursty arrivals reuse
//! warm workers instead of respawning.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use futures::FutureExt;
use tracing::debug;

use crate::job::RunContext;
use crate::manager::{Claim, JobManager};

pub(crate) async fn run(manager: JobManager, worker_id: usize) {
    debug!(worker = worker_id, "consumer loop started");
    let shutdown = manager.shutdown_token();
    loop {
        if shutdown.is_cancelled() {
            let _ = manager.try_retire().await;
            break;
        }

        match manager.claim_next().await {
            Some(claim) => execute(&manager, claim).await,
            None => {
                if !manager.is_accepting_claims().await {
                    // Stopped managers idle their pool away immediately.
                    if manager.try_retire().await {
                        break;
                    }
                }

                let timed_out = tokio::select! {
                    _ = manager.wake_notified().notified() => false,
                    _ = tokio::time::sleep(manager.keep_alive()) => true,
                    _ = shutdown.cancelled() => {
                        let _ = manager.try_retire().await;
                        break;
                    }
                };

                if timed_out {
                    // A wake-up can race the notifier registration; claim
                    // once more before giving the slot back.
                    if let Some(claim) = manager.claim_next().await {
                        execute(&manager, claim).await;
                        continue;
                    }
                    if manager.try_retire().await {
                        break;
                    }
                }
            }
        }
    }
    debug!(worker = worker_id, "consumer loop exited");
}

/// Run one claimed job with panic containment and report the outcome. No
/// failure mode of the body may take the worker loop down.
async fn execute(manager: &JobManager, claim: Claim) {
    let ctx = RunContext::new(
        claim.holder.id,
        claim.holder.run_count,
        claim.token.clone(),
    );
    let job = claim.holder.job.clone();

    let outcome = match AssertUnwindSafe(job.run(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("job panicked: {}", panic_message(&panic))),
    };

    manager.finish_job(claim, outcome).await;
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
