//! Worker pool: a fixed number of slots that claim, run and report jobs.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drudge_core::{
    defaults, ClaimRequest, Error, EventBus, Job, JobStore, Result, WorkerEvent,
};

use crate::backoff::{BackoffPolicy, RetryDecision};
use crate::fetcher::JobFetcher;
use crate::handler::{JobContext, JobResult, TaskList};
use crate::lifecycle::{completion, Completion, CompletionSender};

/// How long a pool keeps claiming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PoolMode {
    /// Keep polling until graceful shutdown.
    #[default]
    Continuous,
    /// Drain what is runnable now, then stop.
    Once,
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent slots.
    pub concurrency: usize,
    /// Idle slots re-check the store at least this often.
    pub poll_interval: Duration,
    pub mode: PoolMode,
    /// Jobs running longer than this fail with a timeout error.
    pub job_timeout: Option<Duration>,
    /// Jobs carrying any of these flags are never claimed.
    pub forbidden_flags: Vec<String>,
    /// Locks older than this are considered abandoned.
    pub lock_expiry: chrono::Duration,
    pub backoff: BackoffPolicy,
    /// Pause after a failed claim.
    pub fetch_error_backoff: Duration,
    /// Retries of complete/fail reports on transient store errors.
    pub report_retries: u32,
    pub report_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            mode: PoolMode::Continuous,
            job_timeout: None,
            forbidden_flags: Vec::new(),
            lock_expiry: chrono::Duration::seconds(defaults::LOCK_EXPIRY_SECS),
            backoff: BackoffPolicy::default(),
            fetch_error_backoff: Duration::from_millis(defaults::FETCH_ERROR_BACKOFF_MS),
            report_retries: defaults::REPORT_RETRIES,
            report_retry_delay: Duration::from_millis(defaults::REPORT_RETRY_DELAY_MS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DRUDGE_CONCURRENCY` | `1` | Concurrent slots |
    /// | `DRUDGE_POLL_INTERVAL_MS` | `2000` | Poll interval when idle |
    /// | `DRUDGE_ONCE` | `false` | Drain runnable jobs, then exit |
    /// | `DRUDGE_JOB_TIMEOUT_SECS` | unset | Per-job execution timeout |
    /// | `DRUDGE_FORBIDDEN_FLAGS` | empty | Comma-separated flags to skip |
    ///
    /// Backoff settings are read by [`BackoffPolicy::from_env`].
    pub fn from_env() -> Self {
        let concurrency = std::env::var("DRUDGE_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::WORKER_CONCURRENCY)
            .max(1);

        let poll_interval_ms = std::env::var("DRUDGE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::POLL_INTERVAL_MS);

        let once = std::env::var("DRUDGE_ONCE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let job_timeout = std::env::var("DRUDGE_JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let forbidden_flags = std::env::var("DRUDGE_FORBIDDEN_FLAGS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
            mode: if once {
                PoolMode::Once
            } else {
                PoolMode::Continuous
            },
            job_timeout,
            forbidden_flags,
            backoff: BackoffPolicy::from_env(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_mode(mut self, mode: PoolMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_forbidden_flags(mut self, flags: Vec<String>) -> Self {
        self.forbidden_flags = flags;
        self
    }

    pub fn with_lock_expiry(mut self, expiry: chrono::Duration) -> Self {
        self.lock_expiry = expiry;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_fetch_error_backoff(mut self, delay: Duration) -> Self {
        self.fetch_error_backoff = delay;
        self
    }

    pub fn with_report_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.report_retries = retries;
        self.report_retry_delay = delay;
        self
    }
}

/// State shared by every slot of one pool.
struct PoolShared {
    id: String,
    store: Arc<dyn JobStore>,
    tasks: TaskList,
    config: WorkerConfig,
    events: EventBus,
    cancel: CancellationToken,
    /// Store wake signal; also notified whenever a job settles.
    wake: Arc<Notify>,
    in_flight: AtomicUsize,
    /// Incremented every time a job settles.
    settled: AtomicU64,
}

/// Builder-style entry point for starting a pool.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    tasks: TaskList,
    config: WorkerConfig,
    events: EventBus,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, tasks: TaskList, config: WorkerConfig) -> Self {
        Self {
            store,
            tasks,
            config,
            events: EventBus::default(),
        }
    }

    /// Publish events on an existing bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Spawn the slots and return a handle for control.
    pub fn start(self) -> WorkerPoolHandle {
        let id = format!("pool-{}", Uuid::new_v4().simple());
        let concurrency = self.config.concurrency.max(1);
        let shared = Arc::new(PoolShared {
            id: id.clone(),
            wake: self.store.wake_signal(),
            store: self.store,
            tasks: self.tasks,
            config: self.config,
            events: self.events,
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            settled: AtomicU64::new(0),
        });

        info!(
            subsystem = "jobs",
            component = "pool",
            op = "start",
            pool_id = %id,
            concurrency,
            mode = ?shared.config.mode,
            tasks = ?shared.tasks.identifiers(),
            "Worker pool started"
        );
        shared.events.emit(WorkerEvent::PoolStarted {
            pool_id: id.clone(),
            concurrency,
        });

        let mut slots = JoinSet::new();
        for slot in 0..concurrency {
            let shared = shared.clone();
            slots.spawn(async move { run_slot(shared, slot).await });
        }

        let (tx, done) = completion();
        tokio::spawn(supervise(shared.clone(), slots, tx));

        WorkerPoolHandle {
            shared,
            completion: done,
        }
    }
}

/// Handle for controlling a running pool.
#[derive(Clone)]
pub struct WorkerPoolHandle {
    shared: Arc<PoolShared>,
    completion: Completion,
}

impl WorkerPoolHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Stop claiming new jobs. Running handlers are never cancelled.
    pub fn graceful_shutdown(&self, reason: &str) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!(
            subsystem = "jobs",
            component = "pool",
            op = "shutdown",
            pool_id = %self.shared.id,
            reason,
            in_flight = self.in_flight(),
            "Worker pool shutting down"
        );
        self.shared.events.emit(WorkerEvent::PoolShutdownRequested {
            pool_id: self.shared.id.clone(),
            reason: reason.to_string(),
        });
        self.shared.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once every slot has drained.
    pub async fn wait(&self) -> Result<()> {
        self.completion.wait().await
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

async fn supervise(
    shared: Arc<PoolShared>,
    mut slots: JoinSet<Result<()>>,
    tx: CompletionSender,
) {
    let mut failure: Option<Error> = None;
    while let Some(joined) = slots.join_next().await {
        let outcome = match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Fatal(format!("Worker slot panicked: {e}"))),
        };
        if let Err(e) = outcome {
            error!(
                subsystem = "jobs",
                component = "pool",
                pool_id = %shared.id,
                error = %e,
                "Worker slot failed; stopping pool"
            );
            shared.cancel.cancel();
            failure.get_or_insert(e);
        }
    }

    info!(
        subsystem = "jobs",
        component = "pool",
        op = "stopped",
        pool_id = %shared.id,
        "Worker pool stopped"
    );
    shared.events.emit(WorkerEvent::PoolStopped {
        pool_id: shared.id.clone(),
    });
    tx.settle(failure.map_or(Ok(()), Err));
}

async fn run_slot(shared: Arc<PoolShared>, slot: usize) -> Result<()> {
    let worker_id = format!("{}-{}", shared.id, slot);
    let request = ClaimRequest::new(worker_id.clone())
        .with_task_identifiers(shared.tasks.identifiers())
        .with_forbidden_flags(shared.config.forbidden_flags.clone())
        .with_lock_expiry(shared.config.lock_expiry);
    let fetcher = JobFetcher::new(shared.store.clone(), request);

    debug!(subsystem = "jobs", component = "slot", worker_id = %worker_id, "Slot started");

    while !shared.cancel.is_cancelled() {
        // Register for wake-ups before claiming so an insert racing the
        // claim is not missed.
        let wake = shared.wake.clone();
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let settled_before = shared.settled.load(Ordering::SeqCst);

        match fetcher.fetch_one().await {
            Ok(Some(job)) => {
                shared.in_flight.fetch_add(1, Ordering::SeqCst);
                process_job(&shared, &worker_id, job).await;
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                shared.settled.fetch_add(1, Ordering::SeqCst);
                // A settled job may have released its queue for another slot.
                shared.wake.notify_waiters();
            }
            Ok(None) => {
                // Once mode ends when nothing is running and nothing settled
                // since this claim began.
                if shared.config.mode == PoolMode::Once
                    && shared.in_flight.load(Ordering::SeqCst) == 0
                {
                    if shared.settled.load(Ordering::SeqCst) == settled_before {
                        break;
                    }
                    continue;
                }
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = &mut notified => {}
                    _ = sleep(shared.config.poll_interval) => {}
                }
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "slot",
                    op = "claim",
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to claim job"
                );
                shared.events.emit(WorkerEvent::FetchFailed {
                    worker_id: worker_id.clone(),
                    error: e.to_string(),
                });
                if shared.config.mode == PoolMode::Once && !e.is_transient() {
                    return Err(e);
                }
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = sleep(shared.config.fetch_error_backoff) => {}
                }
            }
        }
    }

    debug!(subsystem = "jobs", component = "slot", worker_id = %worker_id, "Slot drained");
    Ok(())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        "Task panicked".to_string()
    }
}

/// Run the handler for `job`, converting panics and timeouts into failures.
async fn execute(shared: &PoolShared, worker_id: &str, job: &Job) -> JobResult {
    let Some(handler) = shared.tasks.get(&job.task_identifier) else {
        warn!(
            subsystem = "jobs",
            component = "slot",
            job_id = job.id,
            task_identifier = %job.task_identifier,
            "No handler registered for task"
        );
        return JobResult::Failed(format!(
            "Unsupported task '{}'",
            job.task_identifier
        ));
    };

    let ctx = JobContext::new(job.clone(), worker_id, shared.store.clone());
    let run = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();

    let caught = match shared.config.job_timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(caught) => caught,
            Err(_) => {
                return JobResult::Failed(format!(
                    "Job exceeded timeout of {}ms",
                    limit.as_millis()
                ))
            }
        },
        None => run.await,
    };

    caught.unwrap_or_else(|panic| JobResult::Failed(panic_message(panic)))
}

/// Retry a report on transient store errors.
async fn report<T, F, Fut>(shared: &PoolShared, op: &str, job_id: i64, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < shared.config.report_retries => {
                attempt += 1;
                warn!(
                    subsystem = "jobs",
                    component = "slot",
                    op,
                    job_id,
                    attempt,
                    error = %e,
                    "Transient error reporting job outcome; retrying"
                );
                sleep(shared.config.report_retry_delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn process_job(shared: &PoolShared, worker_id: &str, job: Job) {
    let start = Instant::now();
    let job_id = job.id;
    let store = &shared.store;

    info!(
        subsystem = "jobs",
        component = "slot",
        op = "start",
        worker_id,
        job_id,
        task_identifier = %job.task_identifier,
        queue_name = ?job.queue_name,
        attempts = job.attempts,
        "Processing job"
    );
    shared.events.emit(WorkerEvent::JobStarted {
        job_id,
        task_identifier: job.task_identifier.clone(),
        worker_id: worker_id.to_string(),
        attempts: job.attempts,
    });

    let result = execute(shared, worker_id, &job).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        JobResult::Success => {
            match report(shared, "complete", job_id, move || {
                store.complete_job(job_id, worker_id)
            })
            .await
            {
                Ok(()) => {
                    info!(
                        subsystem = "jobs",
                        component = "slot",
                        op = "complete",
                        job_id,
                        task_identifier = %job.task_identifier,
                        duration_ms,
                        "Job completed successfully"
                    );
                    shared.events.emit(WorkerEvent::JobCompleted {
                        job_id,
                        task_identifier: job.task_identifier.clone(),
                        duration_ms,
                    });
                }
                Err(e) => report_failed(shared, job_id, e),
            }
        }
        JobResult::Failed(message) => {
            let now = Utc::now();
            let decision = shared.config.backoff.decide(&job, now);
            let next_run_at = match decision {
                RetryDecision::Retry { run_at } => run_at,
                RetryDecision::Exhausted => now,
            };
            let error = message.as_str();

            match report(shared, "fail", job_id, move || {
                store.fail_job(job_id, worker_id, error, next_run_at)
            })
            .await
            {
                Ok(failed) if decision == RetryDecision::Exhausted => {
                    error!(
                        subsystem = "jobs",
                        component = "slot",
                        op = "fail",
                        job_id,
                        task_identifier = %failed.task_identifier,
                        attempts = failed.attempts,
                        error = %message,
                        duration_ms,
                        "Job failed permanently"
                    );
                    shared.events.emit(WorkerEvent::JobPermanentlyFailed {
                        job_id,
                        task_identifier: failed.task_identifier,
                        error: message,
                        attempts: failed.attempts,
                    });
                }
                Ok(failed) => {
                    warn!(
                        subsystem = "jobs",
                        component = "slot",
                        op = "fail",
                        job_id,
                        task_identifier = %failed.task_identifier,
                        attempts = failed.attempts,
                        max_attempts = failed.max_attempts,
                        error = %message,
                        next_run_at = %next_run_at,
                        duration_ms,
                        "Job failed; will retry"
                    );
                    shared.events.emit(WorkerEvent::JobFailed {
                        job_id,
                        task_identifier: failed.task_identifier,
                        error: message,
                        attempts: failed.attempts,
                        max_attempts: failed.max_attempts,
                        next_run_at,
                    });
                }
                Err(e) => report_failed(shared, job_id, e),
            }
        }
    }
}

/// The outcome could not be written; the lock expires on its own.
fn report_failed(shared: &PoolShared, job_id: i64, e: Error) {
    error!(
        subsystem = "jobs",
        component = "slot",
        job_id,
        error = %e,
        "Failed to report job outcome; job stays locked until its lock expires"
    );
    shared.events.emit(WorkerEvent::JobReportFailed {
        job_id,
        error: e.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.mode, PoolMode::Continuous);
        assert!(config.job_timeout.is_none());
        assert_eq!(config.lock_expiry, chrono::Duration::hours(4));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_concurrency(0)
            .with_poll_interval(Duration::from_millis(50))
            .with_mode(PoolMode::Once)
            .with_job_timeout(Some(Duration::from_secs(5)))
            .with_forbidden_flags(vec!["suppressible".into()]);

        assert_eq!(config.concurrency, 1, "concurrency is at least one");
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.mode, PoolMode::Once);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.forbidden_flags, vec!["suppressible".to_string()]);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "Task panicked: boom");
        assert_eq!(
            panic_message(Box::new(String::from("kaboom"))),
            "Task panicked: kaboom"
        );
        assert_eq!(panic_message(Box::new(42)), "Task panicked");
    }
}
