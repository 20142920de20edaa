//! In-process job store.
//!
//! Implements the full [`JobStore`] contract behind a single async mutex, so
//! every operation is atomic with respect to every other one. Useful for
//! embedded single-process deployments and for exercising the worker pool
//! without PostgreSQL.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use drudge_core::{
    ClaimRequest, CronJobEntry, Error, Job, JobKeyMode, JobSpec, JobStore, KnownCrontab, Result,
};

/// Claim order: run_at, then priority, then insertion order.
type ClaimKey = (DateTime<Utc>, i32, i64);

#[derive(Debug, Default)]
struct QueueState {
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    job_count: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<i64, Job>,
    /// Jobs that are locked or still have attempts left, in claim order.
    claim_index: BTreeSet<ClaimKey>,
    keys: HashMap<String, i64>,
    queues: HashMap<String, QueueState>,
    crontabs: HashMap<String, KnownCrontab>,
}

fn claim_key(job: &Job) -> ClaimKey {
    (job.run_at, job.priority, job.id)
}

fn indexable(job: &Job) -> bool {
    job.locked_at.is_some() || job.attempts < job.max_attempts
}

impl MemoryState {
    fn unindex(&mut self, job_id: i64) {
        if let Some(job) = self.jobs.get(&job_id) {
            self.claim_index.remove(&claim_key(job));
        }
    }

    fn reindex(&mut self, job_id: i64) {
        if let Some(job) = self.jobs.get(&job_id) {
            if indexable(job) {
                self.claim_index.insert(claim_key(job));
            }
        }
    }

    fn queue_locked(&self, queue_name: &str, now: DateTime<Utc>, lock_expiry: Duration) -> bool {
        self.queues
            .get(queue_name)
            .and_then(|q| q.locked_at)
            .is_some_and(|at| at > now - lock_expiry)
    }

    fn unlock_queue(&mut self, queue_name: Option<&str>, worker_id: &str) {
        if let Some(queue) = queue_name.and_then(|q| self.queues.get_mut(q)) {
            if queue.locked_by.as_deref() == Some(worker_id) {
                queue.locked_at = None;
                queue.locked_by = None;
            }
        }
    }

    fn adjust_queue_count(&mut self, queue_name: Option<&str>, delta: i64) {
        if let Some(name) = queue_name {
            let queue = self.queues.entry(name.to_string()).or_default();
            queue.job_count = (queue.job_count + delta).max(0);
        }
    }

    fn insert_new(&mut self, spec: JobSpec, now: DateTime<Utc>) -> Job {
        self.next_id += 1;
        let job = Job {
            id: self.next_id,
            queue_name: spec.queue_name.clone(),
            task_identifier: spec.task_identifier.clone(),
            max_attempts: spec.effective_max_attempts(),
            priority: spec.effective_priority(),
            payload: spec.payload,
            run_at: spec.run_at.unwrap_or(now),
            attempts: 0,
            last_error: None,
            key: spec.job_key,
            locked_at: None,
            locked_by: None,
            flags: spec.flags,
            created_at: now,
            updated_at: now,
        };
        if let Some(key) = &job.key {
            self.keys.insert(key.clone(), job.id);
        }
        self.adjust_queue_count(job.queue_name.as_deref(), 1);
        self.jobs.insert(job.id, job.clone());
        self.reindex(job.id);
        job
    }

    fn add(&mut self, spec: JobSpec, now: DateTime<Utc>) -> Result<Job> {
        spec.validate()?;

        let existing = spec
            .job_key
            .as_ref()
            .and_then(|k| self.keys.get(k).copied());

        let Some(existing_id) = existing else {
            return Ok(self.insert_new(spec, now));
        };

        let locked = self
            .jobs
            .get(&existing_id)
            .is_some_and(|j| j.locked_at.is_some());

        if locked {
            // The running job keeps going without its key; the new one takes it over.
            if let Some(job) = self.jobs.get_mut(&existing_id) {
                job.key = None;
            }
            return Ok(self.insert_new(spec, now));
        }

        if spec.job_key_mode == JobKeyMode::UnsafeDedupe {
            return self
                .jobs
                .get(&existing_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("Dangling job key {existing_id}")));
        }

        self.unindex(existing_id);
        let old_queue = self.jobs.get(&existing_id).and_then(|j| j.queue_name.clone());
        if old_queue != spec.queue_name {
            self.adjust_queue_count(old_queue.as_deref(), -1);
            self.adjust_queue_count(spec.queue_name.as_deref(), 1);
        }

        let job = self
            .jobs
            .get_mut(&existing_id)
            .ok_or_else(|| Error::Internal(format!("Dangling job key {existing_id}")))?;
        job.task_identifier = spec.task_identifier.clone();
        job.queue_name = spec.queue_name.clone();
        job.max_attempts = spec.effective_max_attempts();
        job.priority = spec.effective_priority();
        job.payload = spec.payload;
        job.flags = spec.flags;
        if spec.job_key_mode == JobKeyMode::Replace {
            job.run_at = spec.run_at.unwrap_or(now);
        }
        job.attempts = 0;
        job.last_error = None;
        job.updated_at = now;
        let updated = job.clone();
        self.reindex(existing_id);
        Ok(updated)
    }

    fn locked_job_mut(&mut self, job_id: i64, worker_id: &str) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {job_id}")))?;
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(Error::NotLockedBy {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }
}

/// [`JobStore`] kept entirely in process memory.
#[derive(Debug)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    notify: Arc<Notify>,
    available: AtomicBool,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Arc::new(Notify::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming (un)reachable. While unavailable every
    /// operation fails with [`Error::StoreUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of every job currently stored, in id order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    /// Snapshot of the known crontab record for `identifier`.
    pub async fn known_crontab(&self, identifier: &str) -> Option<KnownCrontab> {
        self.state.lock().await.crontabs.get(identifier).cloned()
    }

    /// Pending job count recorded for `queue_name`.
    pub async fn queue_job_count(&self, queue_name: &str) -> i64 {
        self.state
            .lock()
            .await
            .queues
            .get(queue_name)
            .map_or(0, |q| q.job_count)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(&self, spec: JobSpec) -> Result<Job> {
        self.ensure_available()?;
        let job = self.state.lock().await.add(spec, Utc::now())?;
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn add_jobs(&self, specs: Vec<JobSpec>) -> Result<u64> {
        self.ensure_available()?;
        for spec in &specs {
            spec.validate()?;
        }
        let now = Utc::now();
        let count = {
            let mut state = self.state.lock().await;
            let mut count = 0u64;
            for spec in specs {
                state.add(spec, now)?;
                count += 1;
            }
            count
        };
        debug!(
            subsystem = "database",
            component = "memory_store",
            op = "add_jobs",
            job_count = count,
            "Inserted jobs"
        );
        self.notify.notify_waiters();
        Ok(count)
    }

    async fn remove_job(&self, job_key: &str) -> Result<Option<Job>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(job_id) = state.keys.get(job_key).copied() else {
            return Ok(None);
        };
        state.keys.remove(job_key);

        let locked = state.jobs.get(&job_id).is_some_and(|j| j.locked_at.is_some());
        if locked {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.key = None;
            }
            return Ok(None);
        }

        state.unindex(job_id);
        let removed = state.jobs.remove(&job_id);
        if let Some(job) = &removed {
            state.adjust_queue_count(job.queue_name.as_deref(), -1);
        }
        Ok(removed)
    }

    async fn claim_jobs(&self, request: &ClaimRequest, limit: usize) -> Result<Vec<Job>> {
        self.ensure_available()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut selected: Vec<i64> = Vec::with_capacity(limit);
        let mut batch_queues: Vec<String> = Vec::new();
        for &(run_at, _, job_id) in state.claim_index.iter() {
            if run_at > now {
                break;
            }
            let Some(job) = state.jobs.get(&job_id) else {
                continue;
            };
            if !request.accepts(job, now) {
                trace!(job_id, "Skipping job not claimable by this request");
                continue;
            }
            if let Some(queue) = job.queue_name.as_deref() {
                if batch_queues.iter().any(|q| q == queue)
                    || state.queue_locked(queue, now, request.lock_expiry)
                {
                    continue;
                }
                batch_queues.push(queue.to_string());
            }
            selected.push(job_id);
            if selected.len() >= limit {
                break;
            }
        }

        let mut claimed = Vec::with_capacity(selected.len());
        for job_id in selected {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.attempts += 1;
            job.locked_at = Some(now);
            job.locked_by = Some(request.worker_id.clone());
            job.updated_at = now;
            let job = job.clone();

            if let Some(queue) = job.queue_name.as_deref() {
                let queue = state.queues.entry(queue.to_string()).or_default();
                queue.locked_at = Some(now);
                queue.locked_by = Some(request.worker_id.clone());
            }
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: i64, worker_id: &str) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let job = state.locked_job_mut(job_id, worker_id)?;
        let queue_name = job.queue_name.clone();
        let key = job.key.clone();

        state.unindex(job_id);
        state.jobs.remove(&job_id);
        if let Some(key) = key {
            if state.keys.get(&key) == Some(&job_id) {
                state.keys.remove(&key);
            }
        }
        state.adjust_queue_count(queue_name.as_deref(), -1);
        state.unlock_queue(queue_name.as_deref(), worker_id);
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Job> {
        self.ensure_available()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.locked_job_mut(job_id, worker_id)?;

        state.unindex(job_id);
        let job = state.locked_job_mut(job_id, worker_id)?;
        job.last_error = Some(error.to_string());
        job.run_at = next_run_at;
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        let job = job.clone();
        state.reindex(job_id);
        state.unlock_queue(job.queue_name.as_deref(), worker_id);
        Ok(job)
    }

    async fn permanently_fail_jobs(&self, job_ids: &[i64], reason: &str) -> Result<Vec<Job>> {
        self.ensure_available()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut failed = Vec::new();
        for &job_id in job_ids {
            let unlocked = state.jobs.get(&job_id).is_some_and(|j| j.locked_at.is_none());
            if !unlocked {
                continue;
            }
            state.unindex(job_id);
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.attempts = job.max_attempts;
                job.last_error = Some(reason.to_string());
                job.updated_at = now;
                failed.push(job.clone());
            }
        }
        Ok(failed)
    }

    async fn force_unlock_workers(&self, worker_ids: &[String]) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let held: Vec<i64> = state
            .jobs
            .values()
            .filter(|j| matches!(&j.locked_by, Some(w) if worker_ids.contains(w)))
            .map(|j| j.id)
            .collect();

        for &job_id in &held {
            state.unindex(job_id);
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.locked_at = None;
                job.locked_by = None;
            }
            state.reindex(job_id);
        }
        for queue in state.queues.values_mut() {
            if matches!(&queue.locked_by, Some(w) if worker_ids.contains(w)) {
                queue.locked_at = None;
                queue.locked_by = None;
            }
        }
        drop(state);

        if !held.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(held.len() as u64)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        self.ensure_available()?;
        Ok(self.state.lock().await.claim_index.len() as i64)
    }

    async fn locked_queue_count(&self) -> Result<i64> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .queues
            .values()
            .filter(|q| q.locked_at.is_some())
            .count() as i64)
    }

    async fn register_crontabs(
        &self,
        identifiers: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<KnownCrontab>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        Ok(identifiers
            .iter()
            .map(|id| {
                state
                    .crontabs
                    .entry(id.clone())
                    .or_insert_with(|| KnownCrontab {
                        identifier: id.clone(),
                        known_since: now,
                        last_execution: None,
                    })
                    .clone()
            })
            .collect())
    }

    async fn schedule_cron_jobs(&self, entries: &[CronJobEntry]) -> Result<usize> {
        self.ensure_available()?;
        let now = Utc::now();
        let mut inserted = 0;
        {
            let mut state = self.state.lock().await;
            for entry in entries {
                let known = state
                    .crontabs
                    .entry(entry.identifier.clone())
                    .or_insert_with(|| KnownCrontab {
                        identifier: entry.identifier.clone(),
                        known_since: entry.timestamp,
                        last_execution: None,
                    });
                if known.last_execution.is_some_and(|last| last >= entry.timestamp) {
                    continue;
                }
                known.last_execution = Some(entry.timestamp);
                state.add(entry.spec.clone(), now)?;
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.notify.notify_waiters();
        }
        Ok(inserted)
    }

    fn wake_signal(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
