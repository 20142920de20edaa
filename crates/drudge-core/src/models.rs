//! Job, queue and cron bookkeeping records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::defaults;
use crate::error::{Error, Result};

/// A unit of work stored in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Ordering domain; `None` means the job runs unordered.
    pub queue_name: Option<String>,
    /// Selects the handler that runs the job.
    pub task_identifier: String,
    pub payload: JsonValue,
    /// Lower values are claimed first among jobs due at the same time.
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    /// Executions so far, incremented when the job is claimed.
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub key: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub flags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job holds a lock that has not yet expired.
    pub fn is_locked(&self, now: DateTime<Utc>, lock_expiry: Duration) -> bool {
        matches!(self.locked_at, Some(at) if at > now - lock_expiry)
    }

    /// Whether every allowed attempt has been used up.
    pub fn is_permanently_failed(&self) -> bool {
        self.attempts >= self.max_attempts && self.locked_at.is_none()
    }

    /// Whether the job itself (ignoring its queue) may be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_expiry: Duration) -> bool {
        !self.is_locked(now, lock_expiry)
            && self.run_at <= now
            && self.attempts < self.max_attempts
    }

    /// Whether the job carries any of the given flags.
    pub fn has_any_flag(&self, flags: &[String]) -> bool {
        self.flags.iter().any(|f| flags.contains(f))
    }
}

/// How `add_job` treats an existing job with the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKeyMode {
    /// Overwrite the existing unlocked job (payload, run_at, queue, ...).
    #[default]
    Replace,
    /// Overwrite everything except `run_at`.
    PreserveRunAt,
    /// Keep the existing job untouched, even if it already failed.
    UnsafeDedupe,
}

impl JobKeyMode {
    /// Database/crontab representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKeyMode::Replace => "replace",
            JobKeyMode::PreserveRunAt => "preserve_run_at",
            JobKeyMode::UnsafeDedupe => "unsafe_dedupe",
        }
    }

    /// Parse the database/crontab representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "replace" => Ok(JobKeyMode::Replace),
            "preserve_run_at" => Ok(JobKeyMode::PreserveRunAt),
            "unsafe_dedupe" => Ok(JobKeyMode::UnsafeDedupe),
            other => Err(Error::InvalidInput(format!("Unknown job key mode: {other}"))),
        }
    }
}

/// Everything needed to insert a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_identifier: String,
    pub payload: JsonValue,
    pub queue_name: Option<String>,
    /// Defaults to "now" when inserted.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub priority: Option<i32>,
    pub job_key: Option<String>,
    #[serde(default)]
    pub job_key_mode: JobKeyMode,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl JobSpec {
    /// Create a spec for `task_identifier` with the given payload.
    pub fn new(task_identifier: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            task_identifier: task_identifier.into(),
            payload,
            queue_name: None,
            run_at: None,
            max_attempts: None,
            priority: None,
            job_key: None,
            job_key_mode: JobKeyMode::default(),
            flags: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_job_key(mut self, key: impl Into<String>) -> Self {
        self.job_key = Some(key.into());
        self
    }

    pub fn with_job_key_mode(mut self, mode: JobKeyMode) -> Self {
        self.job_key_mode = mode;
        self
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Max attempts after applying the default.
    pub fn effective_max_attempts(&self) -> i32 {
        self.max_attempts.unwrap_or(defaults::JOB_MAX_ATTEMPTS)
    }

    /// Priority after applying the default.
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(defaults::JOB_PRIORITY)
    }

    /// Reject specs no store should accept.
    pub fn validate(&self) -> Result<()> {
        if self.task_identifier.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Task identifier cannot be empty".to_string(),
            ));
        }
        if self.effective_max_attempts() < 1 {
            return Err(Error::InvalidInput(format!(
                "max_attempts must be at least 1, got {}",
                self.effective_max_attempts()
            )));
        }
        if matches!(self.queue_name.as_deref(), Some(q) if q.is_empty()) {
            return Err(Error::InvalidInput(
                "Queue name cannot be empty; use None for unordered jobs".to_string(),
            ));
        }
        if matches!(self.job_key.as_deref(), Some(k) if k.is_empty()) {
            return Err(Error::InvalidInput("Job key cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Parameters of a claim request.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Recorded in `locked_by` on the job and its queue.
    pub worker_id: String,
    /// Only jobs for these tasks are claimed; empty means any task.
    pub task_identifiers: Vec<String>,
    /// Jobs carrying any of these flags are skipped.
    pub forbidden_flags: Vec<String>,
    /// Locks older than this are treated as abandoned.
    pub lock_expiry: Duration,
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_identifiers: Vec::new(),
            forbidden_flags: Vec::new(),
            lock_expiry: Duration::seconds(defaults::LOCK_EXPIRY_SECS),
        }
    }

    pub fn with_task_identifiers(mut self, tasks: Vec<String>) -> Self {
        self.task_identifiers = tasks;
        self
    }

    pub fn with_forbidden_flags(mut self, flags: Vec<String>) -> Self {
        self.forbidden_flags = flags;
        self
    }

    pub fn with_lock_expiry(mut self, lock_expiry: Duration) -> Self {
        self.lock_expiry = lock_expiry;
        self
    }

    /// Whether this request may claim `job`, ignoring queue locks.
    pub fn accepts(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.is_claimable(now, self.lock_expiry)
            && (self.task_identifiers.is_empty()
                || self.task_identifiers.contains(&job.task_identifier))
            && !job.has_any_flag(&self.forbidden_flags)
    }
}

/// Persisted bookkeeping for one cron item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownCrontab {
    pub identifier: String,
    /// When the identifier was first registered; backfill never reaches before it.
    pub known_since: DateTime<Utc>,
    /// Latest scheduled timestamp a job was produced for.
    pub last_execution: Option<DateTime<Utc>>,
}

/// A job a cron item wants produced for one scheduled timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CronJobEntry {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub spec: JobSpec,
}
