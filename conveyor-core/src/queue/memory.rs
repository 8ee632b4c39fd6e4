//! In-memory `JobQueue` backed by the merged two-partition structure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::cancel::TagQuery;
use crate::constraint::Constraint;
use crate::error::Result;
use crate::holder::{JobHolder, JobId, SessionId};

use super::JobQueue;
use super::merged::MergedQueue;

/// Non-durable queue; holders live for the lifetime of the process.
#[derive(Debug)]
pub struct MemoryJobQueue {
    inner: Mutex<MergedQueue>,
}

impl MemoryJobQueue {
    /// Empty queue claiming under `session`.
    pub fn new(session: SessionId) -> Self {
        Self {
            inner: Mutex::new(MergedQueue::new(session)),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn insert(&self, holder: JobHolder) -> Result<()> {
        self.inner.lock().await.insert(holder);
        Ok(())
    }

    async fn insert_or_replace(&self, holder: JobHolder) -> Result<()> {
        self.inner.lock().await.insert_or_replace(holder);
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        self.inner.lock().await.remove(id);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.lock().await.count_not_running())
    }

    async fn count_ready(&self, constraint: &Constraint) -> Result<usize> {
        Ok(self.inner.lock().await.count_ready(constraint))
    }

    async fn next_job_and_inc_run_count(
        &self,
        constraint: &Constraint,
    ) -> Result<Option<JobHolder>> {
        Ok(self.inner.lock().await.claim_best(constraint))
    }

    async fn next_job_delay_until(
        &self,
        constraint: &Constraint,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().await.next_admissible_at(constraint))
    }

    async fn find_jobs(&self, query: &TagQuery) -> Result<Vec<JobHolder>> {
        Ok(self.inner.lock().await.find_tagged(query))
    }

    async fn on_job_cancelled(&self, id: JobId) -> Result<()> {
        self.inner.lock().await.mark_cancelled(id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

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

    #[tokio::test]
    async fn insert_claim_remove_roundtrip() {
        let queue = MemoryJobQueue::new(SessionId::new());
        let holder = JobHolder::new(
            Arc::new(Noop),
            &JobParams::new(1).tagged(["t"]),
            Utc::now(),
        );
        let id = holder.id;
        queue.insert(holder).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 1);

        let constraint =
            Constraint::unexcluded(Utc::now(), NetworkStatus::Unmetered);
        let claimed = queue
            .next_job_and_inc_run_count(&constraint)
            .await
            .unwrap()
            .expect("claimable");
        assert_eq!(claimed.id, id);
        assert_eq!(queue.count().await.unwrap(), 0);

        queue.remove(id).await.unwrap();
        assert!(queue.find_jobs(&TagQuery::any(["t"])).await.unwrap().is_empty());
    }
}
