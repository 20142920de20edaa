//! Store abstraction consumed by the worker pool, the cron scheduler and the runner.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::models::{ClaimRequest, CronJobEntry, Job, JobSpec, KnownCrontab};
use crate::Result;

// =============================================================================
// JOB STORE
// =============================================================================

/// Shared backing store of jobs and queues.
///
/// Implementations must make [`claim_jobs`](JobStore::claim_jobs) atomic with
/// respect to every other claimer, including claimers in other processes:
/// no job and no queue may be locked by two workers at once.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one job, honouring `job_key`/`job_key_mode` for upserts.
    async fn add_job(&self, spec: JobSpec) -> Result<Job>;

    /// Insert many jobs; returns how many rows were written.
    async fn add_jobs(&self, specs: Vec<JobSpec>) -> Result<u64>;

    /// Delete an unlocked job by key. Locked jobs only lose their key.
    async fn remove_job(&self, job_key: &str) -> Result<Option<Job>>;

    /// Atomically claim up to `limit` jobs, at most one per queue.
    ///
    /// Claiming locks the job (and its queue) for `request.worker_id` and
    /// increments `attempts`.
    async fn claim_jobs(&self, request: &ClaimRequest, limit: usize) -> Result<Vec<Job>>;

    /// Delete a successfully executed job and release its queue.
    async fn complete_job(&self, job_id: i64, worker_id: &str) -> Result<()>;

    /// Record a failed execution: store `error`, move `run_at` to
    /// `next_run_at`, release the job and its queue.
    ///
    /// A job whose attempts already reached `max_attempts` stays in the store
    /// as permanently failed and is never claimed again.
    async fn fail_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Job>;

    /// Mark unlocked jobs as permanently failed without running them.
    async fn permanently_fail_jobs(&self, job_ids: &[i64], reason: &str) -> Result<Vec<Job>>;

    /// Release every job and queue lock held by the given workers.
    async fn force_unlock_workers(&self, worker_ids: &[String]) -> Result<u64>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: i64) -> Result<Option<Job>>;

    /// Jobs that could still run (not permanently failed).
    async fn pending_count(&self) -> Result<i64>;

    /// Queues currently locked by some worker.
    async fn locked_queue_count(&self) -> Result<i64>;

    /// Register cron identifiers, keeping `known_since` of existing ones.
    async fn register_crontabs(
        &self,
        identifiers: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<KnownCrontab>>;

    /// Produce cron jobs, one per entry whose timestamp is newer than the
    /// identifier's `last_execution`. Advancing `last_execution` and
    /// inserting the job happen atomically; returns the number inserted.
    async fn schedule_cron_jobs(&self, entries: &[CronJobEntry]) -> Result<usize>;

    /// Signal notified whenever new work may be claimable.
    fn wake_signal(&self) -> Arc<Notify>;
}
