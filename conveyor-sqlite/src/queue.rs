//! Durable `JobQueue` on SQLite.
//!
//! One row per holder; the payload column stores the JSON envelope from
//! [`Job::durable_payload`]. Admissibility is evaluated in Rust against the
//! same [`Constraint`] logic the in-memory queue uses, so both queues agree
//! on semantics; SQL contributes the ranking order and the cheap filters.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use conveyor_core::{
    Constraint, ConveyorError, DeadlineBehavior, Job, JobHolder, JobId,
    JobQueue, NetworkRequirement, Result, RunContext, SessionId, TagQuery,
};

use crate::registry::JobRegistry;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS conveyor_jobs (
    ord INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL,
    group_id TEXT,
    single_instance_id TEXT,
    tags TEXT NOT NULL,
    requirement INTEGER NOT NULL DEFAULT 0,
    requirement_lapses_at INTEGER,
    created_at INTEGER NOT NULL,
    delay_until INTEGER,
    deadline_at INTEGER,
    deadline_cancels INTEGER NOT NULL DEFAULT 0,
    retry_limit INTEGER NOT NULL,
    run_count INTEGER NOT NULL DEFAULT 0,
    running_session TEXT,
    cancelled INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_DEQUEUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_conveyor_jobs_ready_dequeue
ON conveyor_jobs (priority DESC, created_at ASC, ord ASC)
"#;

const CANDIDATE_COLUMNS: &str = "ord, id, kind, payload, priority, group_id, \
     single_instance_id, tags, requirement, requirement_lapses_at, \
     created_at, delay_until, deadline_at, deadline_cancels, retry_limit, \
     run_count, running_session, cancelled";

/// Runnable stand-in for metadata-only reads (counts, wake-up scans). It is
/// never executed; claims always decode the real payload first.
struct MetadataOnly;

#[async_trait]
impl Job for MetadataOnly {
    async fn run(&self, ctx: RunContext) -> anyhow::Result<()> {
        anyhow::bail!("metadata-only holder {} cannot run", ctx.job_id())
    }
}

fn storage(err: sqlx::Error) -> ConveyorError {
    ConveyorError::Storage(anyhow::Error::new(err))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        ConveyorError::Internal(format!("timestamp {ms} out of range"))
    })
}

fn requirement_to_i64(requirement: NetworkRequirement) -> i64 {
    match requirement {
        NetworkRequirement::None => 0,
        NetworkRequirement::Connected => 1,
        NetworkRequirement::Unmetered => 2,
    }
}

fn requirement_from_i64(value: i64) -> NetworkRequirement {
    match value {
        1 => NetworkRequirement::Connected,
        2 => NetworkRequirement::Unmetered,
        _ => NetworkRequirement::None,
    }
}

/// Durable queue for one manager session.
#[derive(Debug)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    registry: JobRegistry,
    session: SessionId,
}

impl SqliteJobQueue {
    /// Open (creating if missing) the queue database at `path` and verify
    /// the schema.
    pub async fn open(
        path: impl AsRef<Path>,
        registry: JobRegistry,
        session: SessionId,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect(options, registry, session).await
    }

    /// In-memory database; useful for tests and ephemeral setups.
    pub async fn open_in_memory(
        registry: JobRegistry,
        session: SessionId,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options, registry, session).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        registry: JobRegistry,
        session: SessionId,
    ) -> Result<Self> {
        // Single connection: claims stay serialized at the store level even
        // without an explicit transaction per read-modify-write.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(storage)?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(storage)?;
        sqlx::query(CREATE_DEQUEUE_INDEX)
            .execute(&pool)
            .await
            .map_err(storage)?;

        // Health check before handing the queue out.
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(storage)?;
        if one != 1 {
            return Err(ConveyorError::Internal(
                "sqlite health check returned nonsense".into(),
            ));
        }

        info!(session = %session, "durable queue opened");
        Ok(Self {
            pool,
            registry,
            session,
        })
    }

    fn row_holder(&self, row: &SqliteRow, job: Arc<dyn Job>) -> Result<JobHolder> {
        let id: String = row.try_get("id").map_err(storage)?;
        let id = JobId(Uuid::parse_str(&id).map_err(|err| {
            ConveyorError::Internal(format!("bad job id {id:?}: {err}"))
        })?);
        let running_session: Option<String> =
            row.try_get("running_session").map_err(storage)?;
        let running_session = match running_session {
            Some(raw) => Some(SessionId(Uuid::parse_str(&raw).map_err(
                |err| {
                    ConveyorError::Internal(format!(
                        "bad session id {raw:?}: {err}"
                    ))
                },
            )?)),
            None => None,
        };
        let tags: String = row.try_get("tags").map_err(storage)?;
        let tags: HashSet<String> = serde_json::from_str(&tags)
            .map_err(|err| ConveyorError::Decode(format!("tags column: {err}")))?;

        let delay_until: Option<i64> =
            row.try_get("delay_until").map_err(storage)?;
        let deadline_at: Option<i64> =
            row.try_get("deadline_at").map_err(storage)?;
        let requirement_lapses_at: Option<i64> =
            row.try_get("requirement_lapses_at").map_err(storage)?;
        let deadline_cancels: i64 =
            row.try_get("deadline_cancels").map_err(storage)?;

        Ok(JobHolder {
            id,
            job,
            priority: row.try_get::<i64, _>("priority").map_err(storage)? as i32,
            group_id: row.try_get("group_id").map_err(storage)?,
            single_instance_id: row
                .try_get("single_instance_id")
                .map_err(storage)?,
            tags: Arc::new(tags),
            persistent: true,
            requirement: requirement_from_i64(
                row.try_get("requirement").map_err(storage)?,
            ),
            requirement_lapses_at: requirement_lapses_at
                .map(from_millis)
                .transpose()?,
            created_at: from_millis(
                row.try_get("created_at").map_err(storage)?,
            )?,
            delay_until: delay_until.map(from_millis).transpose()?,
            deadline_at: deadline_at.map(from_millis).transpose()?,
            deadline_behavior: if deadline_cancels != 0 {
                DeadlineBehavior::Cancel
            } else {
                DeadlineBehavior::RunAnyway
            },
            retry_limit: row.try_get::<i64, _>("retry_limit").map_err(storage)?
                as u32,
            run_count: row.try_get::<i64, _>("run_count").map_err(storage)?
                as u32,
            insertion_order: row.try_get::<i64, _>("ord").map_err(storage)?
                as u64,
            running_session,
            cancelled: row.try_get::<i64, _>("cancelled").map_err(storage)?
                != 0,
        })
    }

    async fn candidates(&self) -> Result<Vec<SqliteRow>> {
        sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM conveyor_jobs \
             WHERE cancelled = 0 \
             ORDER BY priority DESC, created_at ASC, ord ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)
    }

    async fn delete_corrupted(&self, id: JobId, err: &ConveyorError) {
        warn!(job = %id, error = %err, "deleting undecodable durable record");
        if let Err(err) = sqlx::query("DELETE FROM conveyor_jobs WHERE id = ?1")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await
        {
            warn!(job = %id, error = %err, "corrupted record cleanup failed");
        }
    }

    /// Decode a candidate row into a runnable holder, deleting the row and
    /// returning `None` when the payload is corrupted or unregistered.
    async fn decode_row(&self, row: &SqliteRow) -> Result<Option<JobHolder>> {
        let meta = self.row_holder(row, Arc::new(MetadataOnly))?;
        let kind: String = row.try_get("kind").map_err(storage)?;
        let payload: String = row.try_get("payload").map_err(storage)?;

        let body = match serde_json::from_str(&payload) {
            Ok(body) => body,
            Err(err) => {
                let err = ConveyorError::Decode(format!("payload column: {err}"));
                self.delete_corrupted(meta.id, &err).await;
                return Ok(None);
            }
        };
        match self.registry.decode(&kind, body) {
            Ok(job) => {
                let mut holder = meta;
                holder.job = job;
                Ok(Some(holder))
            }
            Err(err) => {
                self.delete_corrupted(meta.id, &err).await;
                Ok(None)
            }
        }
    }

    fn session_running(&self, holder: &JobHolder) -> bool {
        holder.running_session == Some(self.session)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn insert(&self, holder: JobHolder) -> Result<()> {
        let payload = holder.job.durable_payload().ok_or_else(|| {
            ConveyorError::Decode(format!(
                "job {} provides no durable payload",
                holder.id
            ))
        })?;
        let body = serde_json::to_string(&payload.body).map_err(|err| {
            ConveyorError::Decode(format!("payload encode: {err}"))
        })?;
        let tags = serde_json::to_string(
            &holder.tags.iter().cloned().collect::<Vec<_>>(),
        )
        .map_err(|err| ConveyorError::Decode(format!("tags encode: {err}")))?;

        sqlx::query(
            "INSERT INTO conveyor_jobs (id, kind, payload, priority, \
             group_id, single_instance_id, tags, requirement, \
             requirement_lapses_at, created_at, delay_until, deadline_at, \
             deadline_cancels, retry_limit, run_count, running_session, \
             cancelled) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13, ?14, ?15, NULL, 0)",
        )
        .bind(holder.id.0.to_string())
        .bind(&payload.kind)
        .bind(body)
        .bind(holder.priority as i64)
        .bind(&holder.group_id)
        .bind(&holder.single_instance_id)
        .bind(tags)
        .bind(requirement_to_i64(holder.requirement))
        .bind(holder.requirement_lapses_at.map(millis))
        .bind(millis(holder.created_at))
        .bind(holder.delay_until.map(millis))
        .bind(holder.deadline_at.map(millis))
        .bind((holder.deadline_behavior == DeadlineBehavior::Cancel) as i64)
        .bind(holder.retry_limit as i64)
        .bind(holder.run_count as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn insert_or_replace(&self, holder: JobHolder) -> Result<()> {
        let payload = holder.job.durable_payload().ok_or_else(|| {
            ConveyorError::Decode(format!(
                "job {} provides no durable payload",
                holder.id
            ))
        })?;
        let body = serde_json::to_string(&payload.body).map_err(|err| {
            ConveyorError::Decode(format!("payload encode: {err}"))
        })?;
        let tags = serde_json::to_string(
            &holder.tags.iter().cloned().collect::<Vec<_>>(),
        )
        .map_err(|err| ConveyorError::Decode(format!("tags encode: {err}")))?;
        let ord = match holder.insertion_order {
            0 => None,
            ord => Some(ord as i64),
        };

        sqlx::query(
            "INSERT OR REPLACE INTO conveyor_jobs (ord, id, kind, payload, \
             priority, group_id, single_instance_id, tags, requirement, \
             requirement_lapses_at, created_at, delay_until, deadline_at, \
             deadline_cancels, retry_limit, run_count, running_session, \
             cancelled) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13, ?14, ?15, ?16, NULL, 0)",
        )
        .bind(ord)
        .bind(holder.id.0.to_string())
        .bind(&payload.kind)
        .bind(body)
        .bind(holder.priority as i64)
        .bind(&holder.group_id)
        .bind(&holder.single_instance_id)
        .bind(tags)
        .bind(requirement_to_i64(holder.requirement))
        .bind(holder.requirement_lapses_at.map(millis))
        .bind(millis(holder.created_at))
        .bind(holder.delay_until.map(millis))
        .bind(holder.deadline_at.map(millis))
        .bind((holder.deadline_behavior == DeadlineBehavior::Cancel) as i64)
        .bind(holder.retry_limit as i64)
        .bind(holder.run_count as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM conveyor_jobs WHERE id = ?1")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conveyor_jobs \
             WHERE cancelled = 0 \
             AND (running_session IS NULL OR running_session <> ?1)",
        )
        .bind(self.session.0.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(count as usize)
    }

    async fn count_ready(&self, constraint: &Constraint) -> Result<usize> {
        let mut seen_groups: HashSet<String> = HashSet::new();
        let mut ready = 0;
        for row in self.candidates().await? {
            let holder = self.row_holder(&row, Arc::new(MetadataOnly))?;
            if !constraint.admits(&holder, self.session_running(&holder)) {
                continue;
            }
            let counts = match &holder.group_id {
                Some(group) => seen_groups.insert(group.clone()),
                None => true,
            };
            if counts {
                ready += 1;
            }
        }
        Ok(ready)
    }

    async fn next_job_and_inc_run_count(
        &self,
        constraint: &Constraint,
    ) -> Result<Option<JobHolder>> {
        for row in self.candidates().await? {
            let meta = self.row_holder(&row, Arc::new(MetadataOnly))?;
            if !constraint.admits(&meta, self.session_running(&meta)) {
                continue;
            }
            // Corrupted records are deleted and the scan continues rather
            // than poisoning the claim.
            let Some(mut holder) = self.decode_row(&row).await? else {
                continue;
            };

            sqlx::query(
                "UPDATE conveyor_jobs \
                 SET run_count = run_count + 1, running_session = ?1 \
                 WHERE id = ?2",
            )
            .bind(self.session.0.to_string())
            .bind(holder.id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

            holder.run_count += 1;
            holder.running_session = Some(self.session);
            return Ok(Some(holder));
        }
        Ok(None)
    }

    async fn next_job_delay_until(
        &self,
        constraint: &Constraint,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for row in self.candidates().await? {
            let holder = self.row_holder(&row, Arc::new(MetadataOnly))?;
            if constraint.exclude_running && self.session_running(&holder) {
                continue;
            }
            if let Some(at) = constraint.admissible_at(&holder) {
                earliest = Some(earliest.map_or(at, |cur| cur.min(at)));
            }
        }
        Ok(earliest)
    }

    async fn find_jobs(&self, query: &TagQuery) -> Result<Vec<JobHolder>> {
        let mut found = Vec::new();
        for row in self.candidates().await? {
            let meta = self.row_holder(&row, Arc::new(MetadataOnly))?;
            if !query.matches(&meta.tags) {
                continue;
            }
            if let Some(holder) = self.decode_row(&row).await? {
                found.push(holder);
            }
        }
        Ok(found)
    }

    async fn on_job_cancelled(&self, id: JobId) -> Result<()> {
        sqlx::query("UPDATE conveyor_jobs SET cancelled = 1 WHERE id = ?1")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM conveyor_jobs")
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}
