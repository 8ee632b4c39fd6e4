//! Top-level orchestrator: owns both queues, the in-flight reservation
//! sets, the consumer pool, and the wake-up timer.
//!
//! Everything that mutates scheduling state funnels through one
//! `tokio::sync::Mutex` so a claim-and-reserve is atomic: two consumers can
//! never take the same holder, and a group with a running job is invisible
//! to further claims until the reservation is released. Job bodies always
//! execute outside that lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, MutexGuard, Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backstop::{NoopBackstop, SchedulingBackstop};
use crate::cancel::{CancelReason, CancelResult, TagMatch, TagQuery};
use crate::config::ManagerConfig;
use crate::constraint::Constraint;
use crate::consumer;
use crate::error::{ConveyorError, Result};
use crate::events::{EventBus, JobEvent};
use crate::holder::{JobHolder, JobId, SessionId};
use crate::job::{Job, JobParams, single_instance_tag};
use crate::network::{
    ManualNetworkMonitor, NetworkMonitor, NetworkRequirement,
};
use crate::queue::{JobQueue, MemoryJobQueue};
use crate::retry::RetryDecision;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Running-group reservations, reference-counted with a copy-on-write
/// snapshot so constraints can be built without cloning per query.
#[derive(Debug, Default)]
struct RunningGroups {
    counts: HashMap<String, usize>,
    snapshot: Arc<HashSet<String>>,
}

impl RunningGroups {
    fn acquire(&mut self, group: &str) {
        *self.counts.entry(group.to_string()).or_insert(0) += 1;
        self.rebuild();
    }

    fn release(&mut self, group: &str) {
        if let Some(count) = self.counts.get_mut(group) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(group);
            }
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        self.snapshot = Arc::new(self.counts.keys().cloned().collect());
    }

    fn snapshot(&self) -> Arc<HashSet<String>> {
        Arc::clone(&self.snapshot)
    }
}

/// Book-keeping for one claimed job while its body runs.
#[derive(Debug)]
struct RunningJob {
    group_id: Option<String>,
    single_instance_id: Option<String>,
    token: CancellationToken,
    cancel_requested: bool,
}

/// A cancel request still waiting on running jobs to finish.
#[derive(Debug)]
struct PendingCancel {
    waiting: HashSet<JobId>,
    cancelled: Vec<JobId>,
    failed_to_cancel: Vec<JobId>,
    tx: Option<oneshot::Sender<CancelResult>>,
}

#[derive(Debug)]
struct WakeTimer {
    at: DateTime<Utc>,
    guard: CancellationToken,
}

#[derive(Debug, Default)]
struct ManagerState {
    running: bool,
    groups: RunningGroups,
    single_ids: HashSet<String>,
    in_flight: HashMap<JobId, RunningJob>,
    pending_cancels: Vec<PendingCancel>,
    consumers: usize,
    worker_serial: usize,
    workers: Vec<JoinHandle<()>>,
    timer: Option<WakeTimer>,
}

struct Inner {
    config: ManagerConfig,
    session: SessionId,
    memory: Arc<dyn JobQueue>,
    durable: Arc<dyn JobQueue>,
    network: Arc<dyn NetworkMonitor>,
    backstop: Arc<dyn SchedulingBackstop>,
    events: EventBus,
    state: Mutex<ManagerState>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A job claimed for execution, handed to a consumer.
pub(crate) struct Claim {
    pub(crate) holder: JobHolder,
    pub(crate) token: CancellationToken,
}

/// Builds a [`JobManager`] with explicit collaborators.
///
/// The session id is fixed at builder creation so a durable queue can be
/// constructed against it before the manager exists:
///
/// ```ignore
/// let builder = JobManager::builder();
/// let durable = SqliteJobQueue::open(path, registry, builder.session_id()).await?;
/// let manager = builder.durable_queue(Arc::new(durable)).build();
/// ```
pub struct JobManagerBuilder {
    config: ManagerConfig,
    session: SessionId,
    durable: Option<Arc<dyn JobQueue>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    backstop: Option<Arc<dyn SchedulingBackstop>>,
}

impl JobManagerBuilder {
    fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            session: SessionId::new(),
            durable: None,
            network: None,
            backstop: None,
        }
    }

    /// Session id this manager incarnation will claim under.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Replace the default configuration.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable queue for persistent jobs. Without one, persistent jobs land
    /// in a second in-memory queue and do not survive the process.
    pub fn durable_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.durable = Some(queue);
        self
    }

    /// Network state collaborator; defaults to always-unmetered.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(monitor);
        self
    }

    /// OS-level wake-up collaborator; defaults to a no-op.
    pub fn backstop(mut self, backstop: Arc<dyn SchedulingBackstop>) -> Self {
        self.backstop = Some(backstop);
        self
    }

    /// Construct the manager, started and accepting work. Must be called
    /// within a tokio runtime.
    pub fn build(self) -> JobManager {
        let session = self.session;
        let inner = Arc::new(Inner {
            config: self.config.normalized(),
            session,
            memory: Arc::new(MemoryJobQueue::new(session)),
            durable: self
                .durable
                .unwrap_or_else(|| Arc::new(MemoryJobQueue::new(session))),
            network: self
                .network
                .unwrap_or_else(|| Arc::new(ManualNetworkMonitor::unmetered())),
            backstop: self.backstop.unwrap_or_else(|| Arc::new(NoopBackstop)),
            events: EventBus::new(EVENT_CHANNEL_CAPACITY),
            state: Mutex::new(ManagerState {
                running: true,
                ..Default::default()
            }),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let manager = JobManager { inner };
        manager.spawn_network_watch();
        info!(session = %session, "job manager started");
        manager
    }
}

impl fmt::Debug for JobManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManagerBuilder")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("has_durable_queue", &self.durable.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to the scheduling engine. Cheap to clone; all clones share one
/// engine.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl JobManager {
    /// Builder with explicit collaborators.
    pub fn builder() -> JobManagerBuilder {
        JobManagerBuilder::new()
    }

    /// Manager with all-default collaborators (in-memory queues only).
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Session id of this incarnation.
    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Enqueue a job.
    ///
    /// If `params` carries a single-instance id that is already queued and
    /// not running, the new job is dropped immediately (`on_added` then
    /// `on_cancel` with [`CancelReason::SingleInstanceAlreadyQueued`]) and
    /// the existing job's id is returned.
    pub async fn add<J: Job>(
        &self,
        params: JobParams,
        job: J,
    ) -> Result<JobId> {
        self.add_arc(params, Arc::new(job)).await
    }

    /// [`add`](Self::add) for an already-shared job.
    pub async fn add_arc(
        &self,
        params: JobParams,
        job: Arc<dyn Job>,
    ) -> Result<JobId> {
        let now = Utc::now();
        let holder = JobHolder::new(Arc::clone(&job), &params, now);
        let id = holder.id;

        let mut state = self.inner.state.lock().await;

        if let Some(single_id) = &params.single_instance_id
            && let Some(existing) =
                self.queued_duplicate(&state, single_id).await?
        {
            drop(state);
            debug!(
                job = %id,
                existing = %existing,
                single_instance_id = %single_id,
                "dropping duplicate single-instance job at enqueue"
            );
            job.on_added();
            job.on_cancel(CancelReason::SingleInstanceAlreadyQueued).await;
            self.inner.events.publish(JobEvent::Cancelled {
                id,
                reason: CancelReason::SingleInstanceAlreadyQueued,
            });
            return Ok(existing);
        }

        let persistent = holder.persistent;
        self.queue_for_persistence(persistent)
            .insert(holder)
            .await?;
        // Runs before the lock drops, so no consumer can claim the job
        // until the hook returns.
        job.on_added();
        self.inner
            .events
            .publish(JobEvent::Added { id, persistent });
        self.consider_consumers(&mut state).await;
        drop(state);

        self.inner.wake.notify_waiters();
        Ok(id)
    }

    /// Fire-and-forget [`add`](Self::add); the callback receives the
    /// outcome on a worker task.
    pub fn add_in_background<J, F>(&self, params: JobParams, job: J, callback: F)
    where
        J: Job,
        F: FnOnce(Result<JobId>) + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            callback(manager.add(params, job).await);
        });
    }

    /// Cancel every queued or running job matching the tags.
    ///
    /// Queued jobs are removed immediately. Running jobs are never
    /// interrupted: their cancellation token flips and classification is
    /// deferred until they finish (success counts as failed-to-cancel).
    /// The returned result is complete: every matched job is in exactly one
    /// bucket.
    pub async fn cancel<I, T>(
        &self,
        match_mode: TagMatch,
        tags: I,
    ) -> Result<CancelResult>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let query = TagQuery {
            match_mode,
            tags: tags.into_iter().map(Into::into).collect(),
        };

        let mut immediate: Vec<JobHolder> = Vec::new();
        let mut result = CancelResult::default();
        let mut waiting: HashSet<JobId> = HashSet::new();
        let rx;
        {
            let mut state = self.inner.state.lock().await;
            for queue in [&self.inner.memory, &self.inner.durable] {
                for holder in queue.find_jobs(&query).await? {
                    if let Some(running) = state.in_flight.get_mut(&holder.id)
                    {
                        if !running.cancel_requested {
                            running.cancel_requested = true;
                            running.token.cancel();
                        }
                        waiting.insert(holder.id);
                    } else {
                        queue.on_job_cancelled(holder.id).await?;
                        queue.remove(holder.id).await?;
                        result.cancelled.push(holder.id);
                        immediate.push(holder);
                    }
                }
            }

            if !waiting.is_empty() {
                let (tx, rx_inner) = oneshot::channel();
                state.pending_cancels.push(PendingCancel {
                    waiting,
                    cancelled: result.cancelled.clone(),
                    failed_to_cancel: Vec::new(),
                    tx: Some(tx),
                });
                rx = Some(rx_inner);
            } else {
                rx = None;
            }
        }

        for holder in immediate {
            holder
                .job
                .on_cancel(CancelReason::CancelledViaRequest)
                .await;
            self.inner.events.publish(JobEvent::Cancelled {
                id: holder.id,
                reason: CancelReason::CancelledViaRequest,
            });
        }

        match rx {
            None => Ok(result),
            Some(rx) => rx.await.map_err(|_| {
                ConveyorError::Internal(
                    "cancel result dropped before delivery".into(),
                )
            }),
        }
    }

    /// Fire-and-forget [`cancel`](Self::cancel); the callback receives the
    /// full [`CancelResult`] once all affected running jobs have finished.
    pub fn cancel_in_background<F>(
        &self,
        match_mode: TagMatch,
        tags: Vec<String>,
        callback: F,
    ) where
        F: FnOnce(Result<CancelResult>) + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            callback(manager.cancel(match_mode, tags).await);
        });
    }

    /// Number of queued holders not claimed by this session, across both
    /// queues.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.inner.memory.count().await?
            + self.inner.durable.count().await?)
    }

    /// Number of claimable jobs right now, group-collapsed.
    pub async fn count_ready(&self) -> Result<usize> {
        let state = self.inner.state.lock().await;
        let constraint = self.claim_constraint(&state, Utc::now());
        drop(state);
        Ok(self.inner.memory.count_ready(&constraint).await?
            + self.inner.durable.count_ready(&constraint).await?)
    }

    /// Drop every queued holder from both queues. Running jobs finish
    /// normally; their queue rows are already gone.
    pub async fn clear(&self) -> Result<()> {
        let _state = self.inner.state.lock().await;
        self.inner.memory.clear().await?;
        self.inner.durable.clear().await?;
        Ok(())
    }

    /// Resume handing out work after a [`stop`](Self::stop).
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        if state.running {
            return;
        }
        state.running = true;
        info!(session = %self.inner.session, "job manager resumed");
        self.consider_consumers(&mut state).await;
        drop(state);
        self.inner.wake.notify_waiters();
    }

    /// Stop handing out work. In-flight jobs run to completion; queued
    /// jobs stay queued. Idle consumers retire immediately.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        state.running = false;
        if let Some(timer) = state.timer.take() {
            timer.guard.cancel();
        }
        drop(state);
        self.inner.wake.notify_waiters();
        info!(session = %self.inner.session, "job manager stopped");
    }

    /// [`stop`](Self::stop), then block until every consumer has exited
    /// (and with them, every in-flight job).
    pub async fn stop_and_wait(&self) {
        self.stop().await;
        let workers: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock().await;
            state.workers.drain(..).collect()
        };
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "consumer task join failed");
            }
        }
    }

    fn queue_for_persistence(&self, persistent: bool) -> &Arc<dyn JobQueue> {
        if persistent {
            &self.inner.durable
        } else {
            &self.inner.memory
        }
    }

    /// First queued-and-not-running holder carrying the reserved tag of
    /// `single_id`, if any.
    async fn queued_duplicate(
        &self,
        state: &ManagerState,
        single_id: &str,
    ) -> Result<Option<JobId>> {
        let query = TagQuery::any([single_instance_tag(single_id)]);
        for queue in [&self.inner.memory, &self.inner.durable] {
            for holder in queue.find_jobs(&query).await? {
                let running = state.in_flight.contains_key(&holder.id)
                    || holder.running_session == Some(self.inner.session);
                if !running {
                    return Ok(Some(holder.id));
                }
            }
        }
        Ok(None)
    }

    /// Constraint reflecting the current in-flight reservations.
    fn claim_constraint(
        &self,
        state: &ManagerState,
        now: DateTime<Utc>,
    ) -> Constraint {
        Constraint {
            now,
            network_status: self.inner.network.status(),
            exclude_running: true,
            exclude_groups: state.groups.snapshot(),
            exclude_tags: Arc::new(
                state
                    .single_ids
                    .iter()
                    .map(|id| single_instance_tag(id))
                    .collect(),
            ),
            exclude_job_ids: HashSet::new(),
        }
    }

    /// Claim the next admissible job, reserving its group and
    /// single-instance id. Returns `None` when stopped or nothing is
    /// admissible (arming the wake-up timer in the latter case).
    pub(crate) async fn claim_next(&self) -> Option<Claim> {
        loop {
            let mut state = self.inner.state.lock().await;
            if !state.running {
                return None;
            }
            let constraint = self.claim_constraint(&state, Utc::now());

            let mut claimed: Option<JobHolder> = None;
            // In-memory first: at equal eligibility it carries no I/O cost.
            for queue in [&self.inner.memory, &self.inner.durable] {
                match queue.next_job_and_inc_run_count(&constraint).await {
                    Ok(Some(holder)) => {
                        claimed = Some(holder);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "queue claim query failed");
                    }
                }
            }

            let Some(holder) = claimed else {
                self.arm_wakeup(&mut state).await;
                return None;
            };

            // A passed cancel-by deadline resolves to terminal
            // cancellation instead of a run.
            if holder.deadline_cancels(constraint.now) {
                let queue = self.queue_for_persistence(holder.persistent);
                let _ = queue.on_job_cancelled(holder.id).await;
                let _ = queue.remove(holder.id).await;
                drop(state);
                holder
                    .job
                    .on_cancel(CancelReason::DeadlineReached)
                    .await;
                self.inner.events.publish(JobEvent::Cancelled {
                    id: holder.id,
                    reason: CancelReason::DeadlineReached,
                });
                continue;
            }

            if let Some(group) = &holder.group_id {
                state.groups.acquire(group);
            }
            if let Some(single_id) = &holder.single_instance_id {
                state.single_ids.insert(single_id.clone());
            }
            let token = CancellationToken::new();
            state.in_flight.insert(
                holder.id,
                RunningJob {
                    group_id: holder.group_id.clone(),
                    single_instance_id: holder.single_instance_id.clone(),
                    token: token.clone(),
                    cancel_requested: false,
                },
            );

            let superseded = match &holder.single_instance_id {
                Some(single_id) => {
                    self.drop_superseded_duplicates(holder.id, single_id)
                        .await
                }
                None => Vec::new(),
            };

            drop(state);

            for duplicate in superseded {
                duplicate
                    .job
                    .on_cancel(CancelReason::SupersededBySingleInstance)
                    .await;
                self.inner.events.publish(JobEvent::Cancelled {
                    id: duplicate.id,
                    reason: CancelReason::SupersededBySingleInstance,
                });
            }

            self.inner.events.publish(JobEvent::Started {
                id: holder.id,
                run_count: holder.run_count,
            });
            debug!(
                job = %holder.id,
                run_count = holder.run_count,
                priority = holder.priority,
                "job claimed"
            );
            return Some(Claim { holder, token });
        }
    }

    /// Remove queued duplicates of a just-claimed single-instance job.
    /// Callers hold the state lock; the removed holders are returned so
    /// their `on_cancel` hooks run after it is released.
    async fn drop_superseded_duplicates(
        &self,
        claimed: JobId,
        single_id: &str,
    ) -> Vec<JobHolder> {
        let query = TagQuery::any([single_instance_tag(single_id)]);
        let mut dropped = Vec::new();
        for queue in [&self.inner.memory, &self.inner.durable] {
            let found = match queue.find_jobs(&query).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(error = %err, "duplicate lookup failed");
                    continue;
                }
            };
            for duplicate in found {
                if duplicate.id == claimed
                    || duplicate.running_session == Some(self.inner.session)
                {
                    continue;
                }
                let _ = queue.on_job_cancelled(duplicate.id).await;
                let _ = queue.remove(duplicate.id).await;
                dropped.push(duplicate);
            }
        }
        dropped
    }

    /// Digest one finished run: success, retry re-queue, or terminal
    /// cancellation, plus pending-cancel classification.
    pub(crate) async fn finish_job(
        &self,
        claim: Claim,
        outcome: std::result::Result<(), anyhow::Error>,
    ) {
        let holder = claim.holder;
        let id = holder.id;

        // Consult the retry policy outside the lock; the hook is user code.
        let failure_decision = outcome.as_ref().err().map(|err| {
            if holder.run_count >= holder.retry_limit {
                (RetryDecision::Cancel, CancelReason::ReachedRetryLimit)
            } else {
                let decision = catch_unwind(AssertUnwindSafe(|| {
                    holder.job.on_failure(
                        err,
                        holder.run_count,
                        holder.retry_limit,
                    )
                }))
                .unwrap_or_else(|_| {
                    warn!(job = %id, "retry policy hook panicked, not retrying");
                    RetryDecision::Cancel
                });
                (decision, CancelReason::CancelledViaRetryPolicy)
            }
        });

        enum Resolution {
            Completed,
            FailedToCancel,
            Retried { run_count: u32, delay: Option<Duration> },
            Cancelled(CancelReason),
        }

        let mut state = self.inner.state.lock().await;
        let running = state.in_flight.remove(&id);
        let cancel_requested =
            running.as_ref().is_some_and(|r| r.cancel_requested);
        let queue = self.queue_for_persistence(holder.persistent);

        let resolution = match (&outcome, cancel_requested) {
            (Ok(()), false) => {
                let _ = queue.remove(id).await;
                Resolution::Completed
            }
            (Ok(()), true) => {
                // Finished before the cancellation could take effect.
                let _ = queue.remove(id).await;
                Resolution::FailedToCancel
            }
            (Err(_), true) => {
                let _ = queue.on_job_cancelled(id).await;
                let _ = queue.remove(id).await;
                Resolution::Cancelled(CancelReason::CancelledWhileRunning)
            }
            (Err(_), false) => {
                let (decision, cancel_reason) =
                    failure_decision.expect("failure path has a decision");
                match decision {
                    RetryDecision::Retry { delay, priority } => {
                        let mut requeued = holder.clone();
                        if let Some(priority) = priority {
                            requeued.priority = priority;
                        }
                        requeued.delay_until = delay
                            .and_then(|d| ChronoDuration::from_std(d).ok())
                            .map(|d| Utc::now() + d);
                        requeued.clear_running_session();
                        match queue.insert_or_replace(requeued).await {
                            Ok(()) => Resolution::Retried {
                                run_count: holder.run_count,
                                delay,
                            },
                            Err(err) => {
                                // The claimed row is still in the store; a
                                // later incarnation reclaims it as a stale
                                // session.
                                error!(
                                    job = %id,
                                    error = %err,
                                    "re-queue for retry failed, job parked until restart"
                                );
                                Resolution::Completed
                            }
                        }
                    }
                    RetryDecision::Cancel => {
                        let _ = queue.on_job_cancelled(id).await;
                        let _ = queue.remove(id).await;
                        Resolution::Cancelled(cancel_reason)
                    }
                }
            }
        };

        // Release reservations; another same-group job may now run.
        if let Some(running) = running {
            if let Some(group) = &running.group_id {
                state.groups.release(group);
            }
            if let Some(single_id) = &running.single_instance_id {
                state.single_ids.remove(single_id);
            }
        }

        // Classify this job for any cancel request that was waiting on it.
        let completed_despite_cancel =
            matches!(resolution, Resolution::FailedToCancel);
        let mut finished_waits = Vec::new();
        for pending in &mut state.pending_cancels {
            if pending.waiting.remove(&id) {
                if completed_despite_cancel {
                    pending.failed_to_cancel.push(id);
                } else {
                    pending.cancelled.push(id);
                }
            }
        }
        let mut index = 0;
        while index < state.pending_cancels.len() {
            if state.pending_cancels[index].waiting.is_empty() {
                finished_waits.push(state.pending_cancels.swap_remove(index));
            } else {
                index += 1;
            }
        }

        self.consider_consumers(&mut state).await;
        drop(state);

        for mut pending in finished_waits {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(CancelResult {
                    cancelled: pending.cancelled,
                    failed_to_cancel: pending.failed_to_cancel,
                });
            }
        }

        match resolution {
            Resolution::Completed | Resolution::FailedToCancel => {
                self.inner.events.publish(JobEvent::Completed { id });
            }
            Resolution::Retried { run_count, delay } => {
                debug!(job = %id, run_count, "job re-queued for retry");
                self.inner.events.publish(JobEvent::Retrying {
                    id,
                    run_count,
                    delay,
                });
            }
            Resolution::Cancelled(reason) => {
                holder.job.on_cancel(reason).await;
                self.inner
                    .events
                    .publish(JobEvent::Cancelled { id, reason });
            }
        }

        self.inner.wake.notify_waiters();
    }

    /// Whether the manager still hands out work.
    pub(crate) async fn is_accepting_claims(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Consumer keep-alive window.
    pub(crate) fn keep_alive(&self) -> Duration {
        self.inner.config.consumer_keep_alive
    }

    pub(crate) fn wake_notified(&self) -> &Notify {
        &self.inner.wake
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Idle consumer asking to exit. Granted when the manager is stopped
    /// or the pool is above its minimum.
    pub(crate) async fn try_retire(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.running
            && state.consumers <= self.inner.config.min_consumer_count
        {
            return false;
        }
        state.consumers -= 1;
        true
    }

    /// Spawn consumers up to the load-factor target and, when only blocked
    /// work remains, arm the wake-up timer.
    fn consider_consumers<'a>(
        &'a self,
        state: &'a mut MutexGuard<'_, ManagerState>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if !state.running {
                return;
            }
            let constraint = self.claim_constraint(state, Utc::now());
            let ready = self
                .inner
                .memory
                .count_ready(&constraint)
                .await
                .unwrap_or_default()
                + self
                    .inner
                    .durable
                    .count_ready(&constraint)
                    .await
                    .unwrap_or_default();

            if ready == 0 {
                self.arm_wakeup(state).await;
                return;
            }

            let config = &self.inner.config;
            while state.consumers < config.max_consumer_count
                && (state.consumers < config.min_consumer_count
                    || ready > state.consumers * config.load_factor)
            {
                self.spawn_consumer(state);
            }
        })
    }

    fn spawn_consumer(&self, state: &mut MutexGuard<'_, ManagerState>) {
        state.consumers += 1;
        state.worker_serial += 1;
        let worker_id = state.worker_serial;
        debug!(worker = worker_id, active = state.consumers, "consumer spawned");
        let manager = self.clone();
        state
            .workers
            .push(tokio::spawn(consumer::run(manager, worker_id)));
        state.workers.retain(|handle| !handle.is_finished());
    }

    /// Arm the one-shot wake-up timer for the earliest known future
    /// admissibility, replacing any later-firing timer.
    async fn arm_wakeup(&self, state: &mut MutexGuard<'_, ManagerState>) {
        let constraint =
            Constraint::unexcluded(Utc::now(), self.inner.network.status());
        let memory_at = self
            .inner
            .memory
            .next_job_delay_until(&constraint)
            .await
            .ok()
            .flatten();
        let durable_at = self
            .inner
            .durable
            .next_job_delay_until(&constraint)
            .await
            .ok()
            .flatten();
        let at = match (memory_at, durable_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (x, None) | (None, x) => x,
        };

        let Some(at) = at else { return };
        if at <= constraint.now {
            // Admissible-but-excluded work resurfaces via the notifier when
            // the blocking reservation is released; a timer cannot help.
            return;
        }
        if state.timer.as_ref().is_some_and(|timer| timer.at <= at) {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.guard.cancel();
        }

        let guard = self.inner.shutdown.child_token();
        state.timer = Some(WakeTimer {
            at,
            guard: guard.clone(),
        });
        debug!(wake_at = %at, "arming wake-up timer");

        let manager = self.clone();
        tokio::spawn(async move {
            let dur = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(dur) => {
                    let mut state = manager.inner.state.lock().await;
                    state.timer = None;
                    manager.consider_consumers(&mut state).await;
                    drop(state);
                    manager.inner.wake.notify_waiters();
                }
            }
        });

        self.inner
            .backstop
            .request_wakeup(at, NetworkRequirement::None)
            .await;
    }

    /// React to network ceiling changes without waiting for the timer.
    fn spawn_network_watch(&self) {
        let mut rx = self.inner.network.watch();
        let shutdown = self.inner.shutdown.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(inner) = weak.upgrade() else { break };
                        let manager = JobManager { inner };
                        let status = manager.inner.network.status();
                        debug!(status = %status, "network ceiling changed");
                        let mut state = manager.inner.state.lock().await;
                        manager.consider_consumers(&mut state).await;
                        drop(state);
                        manager.inner.wake.notify_waiters();
                    }
                }
            }
        });
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}
