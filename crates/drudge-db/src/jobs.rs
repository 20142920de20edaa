//! PostgreSQL job store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drudge_core::{
    ClaimRequest, CronJobEntry, Error, Job, JobKeyMode, JobSpec, JobStore, KnownCrontab, Result,
};

use crate::pool::{create_pool_with_config, PoolConfig};
use crate::schema::{insert_channel, install_schema, validate_schema_name};

/// Map connection-level failures to [`Error::StoreUnavailable`].
fn store_error(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::StoreUnavailable(e.to_string()),
        other => Error::Database(other),
    }
}

fn is_unique_violation(e: &Error) -> bool {
    matches!(e, Error::Database(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505"))
}

/// SQL text for one schema, rendered once at construction.
#[derive(Debug)]
struct Statements {
    upsert_queue: String,
    decrement_queue: String,
    release_queue: String,
    complete_queue: String,
    find_by_key: String,
    clear_key: String,
    insert_job: String,
    update_keyed: String,
    claim: String,
    delete_locked: String,
    lock_owner: String,
    fail: String,
    permanently_fail: String,
    unlock_jobs: String,
    unlock_queues: String,
    clear_locked_key: String,
    delete_unlocked_key: String,
    get_job: String,
    pending_count: String,
    locked_queue_count: String,
    register_crontabs: String,
    select_crontabs: String,
    advance_crontab: String,
}

impl Statements {
    fn new(s: &str) -> Self {
        Self {
            upsert_queue: format!(
                "INSERT INTO {s}.job_queues (queue_name, job_count) VALUES ($1, 1)
                 ON CONFLICT (queue_name) DO UPDATE SET job_count = job_queues.job_count + 1"
            ),
            decrement_queue: format!(
                "UPDATE {s}.job_queues SET job_count = greatest(job_count - 1, 0)
                 WHERE queue_name = $1"
            ),
            release_queue: format!(
                "UPDATE {s}.job_queues SET locked_at = NULL, locked_by = NULL
                 WHERE queue_name = $1 AND locked_by = $2"
            ),
            complete_queue: format!(
                "UPDATE {s}.job_queues
                 SET job_count = greatest(job_count - 1, 0),
                     locked_at = CASE WHEN locked_by = $2 THEN NULL ELSE locked_at END,
                     locked_by = CASE WHEN locked_by = $2 THEN NULL ELSE locked_by END
                 WHERE queue_name = $1"
            ),
            find_by_key: format!("SELECT * FROM {s}.jobs WHERE key = $1 FOR UPDATE"),
            clear_key: format!(
                "UPDATE {s}.jobs SET key = NULL, updated_at = now() WHERE id = $1"
            ),
            insert_job: format!(
                "INSERT INTO {s}.jobs
                     (queue_name, task_identifier, payload, priority, run_at, max_attempts, key, flags)
                 VALUES ($1, $2, $3, $4, coalesce($5::timestamptz, now()), $6, $7, $8)
                 RETURNING *"
            ),
            update_keyed: format!(
                "UPDATE {s}.jobs
                 SET queue_name = $2, task_identifier = $3, payload = $4, priority = $5,
                     run_at = CASE WHEN $9 THEN run_at ELSE coalesce($6::timestamptz, now()) END,
                     max_attempts = $7, flags = $8, attempts = 0, last_error = NULL,
                     updated_at = now()
                 WHERE id = $1
                 RETURNING *"
            ),
            // Filter by task and flags before locking; lock the job row and its
            // queue row in the same statement.
            claim: format!(
                "WITH j AS (
                     SELECT jobs.id, jobs.queue_name
                     FROM {s}.jobs
                     WHERE jobs.run_at <= now()
                       AND jobs.attempts < jobs.max_attempts
                       AND (jobs.locked_at IS NULL
                            OR jobs.locked_at < now() - make_interval(secs => $2::float8))
                       AND (cardinality($3::text[]) = 0 OR jobs.task_identifier = ANY($3::text[]))
                       AND NOT (jobs.flags && $4::text[])
                       AND (jobs.queue_name IS NULL OR EXISTS (
                           SELECT 1 FROM {s}.job_queues
                           WHERE job_queues.queue_name = jobs.queue_name
                             AND (job_queues.locked_at IS NULL
                                  OR job_queues.locked_at < now() - make_interval(secs => $2::float8))
                           FOR UPDATE SKIP LOCKED
                       ))
                     ORDER BY jobs.run_at ASC, jobs.priority ASC, jobs.id ASC
                     LIMIT 1
                     FOR UPDATE SKIP LOCKED
                 ),
                 q AS (
                     UPDATE {s}.job_queues
                     SET locked_at = now(), locked_by = $1
                     FROM j
                     WHERE job_queues.queue_name = j.queue_name
                 )
                 UPDATE {s}.jobs
                 SET attempts = jobs.attempts + 1, locked_at = now(), locked_by = $1,
                     updated_at = now()
                 FROM j
                 WHERE jobs.id = j.id
                 RETURNING jobs.*"
            ),
            delete_locked: format!(
                "DELETE FROM {s}.jobs WHERE id = $1 AND locked_by = $2 RETURNING queue_name"
            ),
            lock_owner: format!("SELECT locked_by FROM {s}.jobs WHERE id = $1"),
            fail: format!(
                "UPDATE {s}.jobs
                 SET last_error = $3, run_at = $4, locked_at = NULL, locked_by = NULL,
                     updated_at = now()
                 WHERE id = $1 AND locked_by = $2
                 RETURNING *"
            ),
            permanently_fail: format!(
                "UPDATE {s}.jobs
                 SET attempts = max_attempts, last_error = $2, updated_at = now()
                 WHERE id = ANY($1) AND locked_at IS NULL
                 RETURNING *"
            ),
            unlock_jobs: format!(
                "UPDATE {s}.jobs SET locked_at = NULL, locked_by = NULL
                 WHERE locked_by = ANY($1)"
            ),
            unlock_queues: format!(
                "UPDATE {s}.job_queues SET locked_at = NULL, locked_by = NULL
                 WHERE locked_by = ANY($1)"
            ),
            clear_locked_key: format!(
                "UPDATE {s}.jobs SET key = NULL, updated_at = now()
                 WHERE key = $1 AND locked_at IS NOT NULL"
            ),
            delete_unlocked_key: format!(
                "DELETE FROM {s}.jobs WHERE key = $1 AND locked_at IS NULL RETURNING *"
            ),
            get_job: format!("SELECT * FROM {s}.jobs WHERE id = $1"),
            pending_count: format!(
                "SELECT COUNT(*) FROM {s}.jobs
                 WHERE attempts < max_attempts OR locked_at IS NOT NULL"
            ),
            locked_queue_count: format!(
                "SELECT COUNT(*) FROM {s}.job_queues WHERE locked_at IS NOT NULL"
            ),
            register_crontabs: format!(
                "INSERT INTO {s}.known_crontabs (identifier, known_since)
                 SELECT unnest($1::text[]), $2
                 ON CONFLICT (identifier) DO NOTHING"
            ),
            select_crontabs: format!(
                "SELECT identifier, known_since, last_execution
                 FROM {s}.known_crontabs WHERE identifier = ANY($1)"
            ),
            advance_crontab: format!(
                "INSERT INTO {s}.known_crontabs AS kc (identifier, known_since, last_execution)
                 VALUES ($1, $2, $2)
                 ON CONFLICT (identifier) DO UPDATE SET last_execution = EXCLUDED.last_execution
                 WHERE kc.last_execution IS NULL OR kc.last_execution < EXCLUDED.last_execution
                 RETURNING identifier"
            ),
        }
    }
}

/// PostgreSQL implementation of [`JobStore`].
///
/// Claims use `FOR UPDATE SKIP LOCKED` on both the job row and its queue row,
/// so any number of processes can share one schema.
pub struct PgJobStore {
    pool: PgPool,
    schema: String,
    prepared: bool,
    sql: Arc<Statements>,
    /// Wakes idle worker slots when jobs are inserted.
    notify: Arc<Notify>,
}

impl PgJobStore {
    /// Create a store over `schema` using an existing pool.
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        validate_schema_name(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
            prepared: true,
            sql: Arc::new(Statements::new(schema)),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Connect a new pool and create a store over `schema`.
    pub async fn connect(database_url: &str, schema: &str, config: PoolConfig) -> Result<Self> {
        validate_schema_name(schema)?;
        let prepared = config.prepared_statements;
        let pool = create_pool_with_config(database_url, config).await?;
        Ok(Self::new(pool, schema)?.with_prepared_statements(prepared))
    }

    /// Whether statements are prepared and cached on the connection.
    pub fn with_prepared_statements(mut self, prepared: bool) -> Self {
        self.prepared = prepared;
        self
    }

    /// Share an existing wake signal.
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = notify;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Create this store's tables if missing.
    pub async fn install(&self) -> Result<()> {
        install_schema(&self.pool, &self.schema).await
    }

    /// Forward `NOTIFY`s from other processes to the local wake signal.
    ///
    /// The listener reconnects on its own after connection loss; abort the
    /// returned handle to stop listening.
    pub async fn listen(&self) -> Result<JoinHandle<()>> {
        let channel = insert_channel(&self.schema);
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(store_error)?;
        listener.listen(&channel).await.map_err(store_error)?;

        info!(
            subsystem = "database",
            component = "jobs",
            op = "listen",
            channel = %channel,
            "Listening for job inserts"
        );

        let notify = self.notify.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(_) => notify.notify_waiters(),
                    Err(e) => {
                        warn!(
                            subsystem = "database",
                            component = "jobs",
                            op = "listen",
                            error = %e,
                            "Job insert listener failed; retrying"
                        );
                        tokio::time::sleep(StdDuration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: &PgRow) -> Job {
        Job {
            id: row.get("id"),
            queue_name: row.get("queue_name"),
            task_identifier: row.get("task_identifier"),
            payload: row.get("payload"),
            priority: row.get("priority"),
            run_at: row.get("run_at"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            last_error: row.get("last_error"),
            key: row.get("key"),
            locked_at: row.get("locked_at"),
            locked_by: row.get("locked_by"),
            flags: row.get("flags"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    async fn announce_insert(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .persistent(self.prepared)
            .bind(insert_channel(&self.schema))
            .execute(&mut **tx)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn insert_row(&self, tx: &mut Transaction<'_, Postgres>, spec: &JobSpec) -> Result<Job> {
        if let Some(queue) = &spec.queue_name {
            sqlx::query(&self.sql.upsert_queue)
                .persistent(self.prepared)
                .bind(queue)
                .execute(&mut **tx)
                .await
                .map_err(store_error)?;
        }

        let row = sqlx::query(&self.sql.insert_job)
            .persistent(self.prepared)
            .bind(&spec.queue_name)
            .bind(&spec.task_identifier)
            .bind(&spec.payload)
            .bind(spec.effective_priority())
            .bind(spec.run_at)
            .bind(spec.effective_max_attempts())
            .bind(&spec.job_key)
            .bind(&spec.flags)
            .fetch_one(&mut **tx)
            .await
            .map_err(store_error)?;
        Ok(Self::parse_job_row(&row))
    }

    /// Insert or upsert one job inside `tx`, honouring the job key mode.
    async fn add_in_tx(&self, tx: &mut Transaction<'_, Postgres>, spec: &JobSpec) -> Result<Job> {
        spec.validate()?;

        let existing = match &spec.job_key {
            Some(key) => sqlx::query(&self.sql.find_by_key)
                .persistent(self.prepared)
                .bind(key)
                .fetch_optional(&mut **tx)
                .await
                .map_err(store_error)?
                .map(|row| Self::parse_job_row(&row)),
            None => None,
        };

        let Some(existing) = existing else {
            return self.insert_row(tx, spec).await;
        };

        if existing.locked_at.is_some() {
            sqlx::query(&self.sql.clear_key)
                .persistent(self.prepared)
                .bind(existing.id)
                .execute(&mut **tx)
                .await
                .map_err(store_error)?;
            return self.insert_row(tx, spec).await;
        }

        if spec.job_key_mode == JobKeyMode::UnsafeDedupe {
            return Ok(existing);
        }

        if existing.queue_name != spec.queue_name {
            if let Some(old) = &existing.queue_name {
                sqlx::query(&self.sql.decrement_queue)
                    .persistent(self.prepared)
                    .bind(old)
                    .execute(&mut **tx)
                    .await
                    .map_err(store_error)?;
            }
            if let Some(new) = &spec.queue_name {
                sqlx::query(&self.sql.upsert_queue)
                    .persistent(self.prepared)
                    .bind(new)
                    .execute(&mut **tx)
                    .await
                    .map_err(store_error)?;
            }
        }

        let row = sqlx::query(&self.sql.update_keyed)
            .persistent(self.prepared)
            .bind(existing.id)
            .bind(&spec.queue_name)
            .bind(&spec.task_identifier)
            .bind(&spec.payload)
            .bind(spec.effective_priority())
            .bind(spec.run_at)
            .bind(spec.effective_max_attempts())
            .bind(&spec.flags)
            .bind(spec.job_key_mode == JobKeyMode::PreserveRunAt)
            .fetch_one(&mut **tx)
            .await
            .map_err(store_error)?;
        Ok(Self::parse_job_row(&row))
    }

    async fn add_job_once(&self, spec: &JobSpec) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let job = self.add_in_tx(&mut tx, spec).await?;
        self.announce_insert(&mut tx).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(job)
    }

    async fn claim_one(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        let expiry_secs = request.lock_expiry.num_milliseconds() as f64 / 1000.0;
        let row = sqlx::query(&self.sql.claim)
            .persistent(self.prepared)
            .bind(&request.worker_id)
            .bind(expiry_secs)
            .bind(&request.task_identifiers)
            .bind(&request.forbidden_flags)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.as_ref().map(Self::parse_job_row))
    }

    /// Explain why `job_id` could not be settled by `worker_id`.
    async fn not_locked_error(&self, job_id: i64, worker_id: &str) -> Error {
        let owner = sqlx::query(&self.sql.lock_owner)
            .persistent(self.prepared)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;
        match owner {
            Ok(Some(_)) => Error::NotLockedBy {
                job_id,
                worker_id: worker_id.to_string(),
            },
            Ok(None) => Error::NotFound(format!("Job {job_id}")),
            Err(e) => store_error(e),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add_job(&self, spec: JobSpec) -> Result<Job> {
        // Two producers racing on a new key: the loser retries as an upsert.
        let job = match self.add_job_once(&spec).await {
            Err(e) if spec.job_key.is_some() && is_unique_violation(&e) => {
                debug!(
                    subsystem = "database",
                    component = "jobs",
                    op = "add_job",
                    "Job key conflict; retrying as upsert"
                );
                self.add_job_once(&spec).await?
            }
            other => other?,
        };
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn add_jobs(&self, specs: Vec<JobSpec>) -> Result<u64> {
        for spec in &specs {
            spec.validate()?;
        }
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let mut count = 0u64;
        for spec in &specs {
            self.add_in_tx(&mut tx, spec).await?;
            count += 1;
        }
        if count > 0 {
            self.announce_insert(&mut tx).await?;
        }
        tx.commit().await.map_err(store_error)?;

        debug!(
            subsystem = "database",
            component = "jobs",
            op = "add_jobs",
            job_count = count,
            "Inserted jobs"
        );
        self.notify.notify_waiters();
        Ok(count)
    }

    async fn remove_job(&self, job_key: &str) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query(&self.sql.clear_locked_key)
            .persistent(self.prepared)
            .bind(job_key)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let removed = sqlx::query(&self.sql.delete_unlocked_key)
            .persistent(self.prepared)
            .bind(job_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?
            .map(|row| Self::parse_job_row(&row));

        if let Some(queue) = removed.as_ref().and_then(|j| j.queue_name.as_ref()) {
            sqlx::query(&self.sql.decrement_queue)
                .persistent(self.prepared)
                .bind(queue)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)?;
        Ok(removed)
    }

    async fn claim_jobs(&self, request: &ClaimRequest, limit: usize) -> Result<Vec<Job>> {
        // Each claim commits its queue lock before the next one runs, so a
        // batch never holds two jobs of the same queue.
        let mut claimed = Vec::with_capacity(limit);
        while claimed.len() < limit {
            match self.claim_one(request).await? {
                Some(job) => claimed.push(job),
                None => break,
            }
        }
        if !claimed.is_empty() {
            debug!(
                subsystem = "database",
                component = "jobs",
                op = "claim",
                worker_id = %request.worker_id,
                job_count = claimed.len(),
                "Claimed jobs"
            );
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: i64, worker_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let deleted = sqlx::query(&self.sql.delete_locked)
            .persistent(self.prepared)
            .bind(job_id)
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;

        let Some(row) = deleted else {
            drop(tx);
            return Err(self.not_locked_error(job_id, worker_id).await);
        };

        let queue_name: Option<String> = row.get("queue_name");
        if let Some(queue) = queue_name {
            sqlx::query(&self.sql.complete_queue)
                .persistent(self.prepared)
                .bind(queue)
                .bind(worker_id)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let updated = sqlx::query(&self.sql.fail)
            .persistent(self.prepared)
            .bind(job_id)
            .bind(worker_id)
            .bind(error)
            .bind(next_run_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;

        let Some(row) = updated else {
            drop(tx);
            return Err(self.not_locked_error(job_id, worker_id).await);
        };
        let job = Self::parse_job_row(&row);

        if let Some(queue) = &job.queue_name {
            sqlx::query(&self.sql.release_queue)
                .persistent(self.prepared)
                .bind(queue)
                .bind(worker_id)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)?;
        Ok(job)
    }

    async fn permanently_fail_jobs(&self, job_ids: &[i64], reason: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(&self.sql.permanently_fail)
            .persistent(self.prepared)
            .bind(job_ids)
            .bind(reason)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.iter().map(Self::parse_job_row).collect())
    }

    async fn force_unlock_workers(&self, worker_ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let released = sqlx::query(&self.sql.unlock_jobs)
            .persistent(self.prepared)
            .bind(worker_ids)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?
            .rows_affected();
        sqlx::query(&self.sql.unlock_queues)
            .persistent(self.prepared)
            .bind(worker_ids)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        if released > 0 {
            info!(
                subsystem = "database",
                component = "jobs",
                op = "force_unlock",
                job_count = released,
                "Released locks held by stopped workers"
            );
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&self.sql.get_job)
            .persistent(self.prepared)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.as_ref().map(Self::parse_job_row))
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(&self.sql.pending_count)
            .persistent(self.prepared)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(count.0)
    }

    async fn locked_queue_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(&self.sql.locked_queue_count)
            .persistent(self.prepared)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(count.0)
    }

    async fn register_crontabs(
        &self,
        identifiers: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<KnownCrontab>> {
        sqlx::query(&self.sql.register_crontabs)
            .persistent(self.prepared)
            .bind(identifiers)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        let rows = sqlx::query(&self.sql.select_crontabs)
            .persistent(self.prepared)
            .bind(identifiers)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let mut known: HashMap<String, KnownCrontab> = rows
            .iter()
            .map(|row| {
                let known = KnownCrontab {
                    identifier: row.get("identifier"),
                    known_since: row.get("known_since"),
                    last_execution: row.get("last_execution"),
                };
                (known.identifier.clone(), known)
            })
            .collect();

        Ok(identifiers
            .iter()
            .filter_map(|id| known.remove(id))
            .collect())
    }

    async fn schedule_cron_jobs(&self, entries: &[CronJobEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let mut inserted = 0;
        for entry in entries {
            let advanced = sqlx::query(&self.sql.advance_crontab)
                .persistent(self.prepared)
                .bind(&entry.identifier)
                .bind(entry.timestamp)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_error)?;
            if advanced.is_none() {
                continue;
            }
            self.add_in_tx(&mut tx, &entry.spec).await?;
            inserted += 1;
        }
        if inserted > 0 {
            self.announce_insert(&mut tx).await?;
        }
        tx.commit().await.map_err(store_error)?;

        if inserted > 0 {
            self.notify.notify_waiters();
        }
        Ok(inserted)
    }

    fn wake_signal(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
