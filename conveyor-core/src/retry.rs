//! Retry policy output consumed once per failed run.

use std::time::Duration;

/// Verdict returned by [`Job::on_failure`](crate::job::Job::on_failure).
///
/// `Retry` may adjust the job's delay and priority for the re-queue;
/// leaving them unset keeps the job immediately eligible at its current
/// priority. `Cancel` sends the job to terminal cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job, optionally rescheduled.
    Retry {
        /// New delay applied from the moment of the decision.
        delay: Option<Duration>,
        /// Replacement priority for the re-queued job.
        priority: Option<i32>,
    },
    /// Stop retrying; the job is cancelled with
    /// [`CancelReason::CancelledViaRetryPolicy`](crate::cancel::CancelReason).
    Cancel,
}

impl RetryDecision {
    /// Plain retry: no backoff, same priority.
    pub fn retry() -> Self {
        RetryDecision::Retry {
            delay: None,
            priority: None,
        }
    }

    /// Retry after `delay`.
    pub fn retry_in(delay: Duration) -> Self {
        RetryDecision::Retry {
            delay: Some(delay),
            priority: None,
        }
    }

    /// Exponential backoff helper: `base * 2^(run_count - 1)`, capped.
    pub fn backoff(base: Duration, cap: Duration, run_count: u32) -> Self {
        let exp = run_count.saturating_sub(1).min(31);
        let delay = base.saturating_mul(1u32 << exp).min(cap);
        RetryDecision::retry_in(delay)
    }

    /// Whether this decision re-queues the job.
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);

        let expect = |run: u32, ms: u64| {
            let RetryDecision::Retry { delay, .. } =
                RetryDecision::backoff(base, cap, run)
            else {
                panic!("backoff never cancels");
            };
            assert_eq!(delay, Some(Duration::from_millis(ms)));
        };

        expect(1, 100);
        expect(2, 200);
        expect(3, 400);
        expect(4, 800);
        expect(5, 1000);
        expect(20, 1000);
    }
}
