//! Worker event types and the broadcast event bus.
//!
//! The pool, the cron scheduler and the runner publish [`WorkerEvent`]s on a
//! shared [`EventBus`]. Observers (logging bridges, metrics, tests) subscribe
//! independently. Emission never blocks and never fails: with no subscriber
//! the event is dropped, and a lagging subscriber loses the oldest events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything observable about a running worker process.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"JobCompleted","job_id":1,"task_identifier":"send_email",...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// A worker pool started its slots.
    PoolStarted { pool_id: String, concurrency: usize },
    /// Graceful shutdown was requested; no new jobs will be claimed.
    PoolShutdownRequested { pool_id: String, reason: String },
    /// Every slot of the pool has drained.
    PoolStopped { pool_id: String },
    /// A slot claimed a job and is about to run it.
    JobStarted {
        job_id: i64,
        task_identifier: String,
        worker_id: String,
        attempts: i32,
    },
    /// A job's handler succeeded and the job was removed.
    JobCompleted {
        job_id: i64,
        task_identifier: String,
        duration_ms: u64,
    },
    /// A job's handler failed; the job will be retried at `next_run_at`.
    JobFailed {
        job_id: i64,
        task_identifier: String,
        error: String,
        attempts: i32,
        max_attempts: i32,
        next_run_at: DateTime<Utc>,
    },
    /// A job failed its final attempt and will not run again.
    JobPermanentlyFailed {
        job_id: i64,
        task_identifier: String,
        error: String,
        attempts: i32,
    },
    /// The outcome of a job could not be written back; it stays locked until
    /// its lock expires.
    JobReportFailed { job_id: i64, error: String },
    /// A claim request failed; the slot backs off before polling again.
    FetchFailed { worker_id: String, error: String },
    /// The cron scheduler produced jobs for one timestamp.
    CronJobsScheduled {
        timestamp: DateTime<Utc>,
        job_count: usize,
        backfilled: bool,
    },
    /// A cron tick failed against the store.
    CronTickFailed { error: String, consecutive: u32 },
    /// The cron scheduler stopped.
    CronStopped,
    /// The runner began stopping.
    Stop,
}

impl WorkerEvent {
    /// Dot-namespaced event name, e.g. `job.completed`.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkerEvent::PoolStarted { .. } => "pool.started",
            WorkerEvent::PoolShutdownRequested { .. } => "pool.shutdown_requested",
            WorkerEvent::PoolStopped { .. } => "pool.stopped",
            WorkerEvent::JobStarted { .. } => "job.started",
            WorkerEvent::JobCompleted { .. } => "job.completed",
            WorkerEvent::JobFailed { .. } => "job.failed",
            WorkerEvent::JobPermanentlyFailed { .. } => "job.permanently_failed",
            WorkerEvent::JobReportFailed { .. } => "job.report_failed",
            WorkerEvent::FetchFailed { .. } => "pool.fetch_failed",
            WorkerEvent::CronJobsScheduled { .. } => "cron.scheduled",
            WorkerEvent::CronTickFailed { .. } => "cron.tick_failed",
            WorkerEvent::CronStopped => "cron.stopped",
            WorkerEvent::Stop => "runner.stop",
        }
    }

    /// Job id this event relates to, if any.
    pub fn job_id(&self) -> Option<i64> {
        match self {
            WorkerEvent::JobStarted { job_id, .. }
            | WorkerEvent::JobCompleted { job_id, .. }
            | WorkerEvent::JobFailed { job_id, .. }
            | WorkerEvent::JobPermanentlyFailed { job_id, .. }
            | WorkerEvent::JobReportFailed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

/// Broadcast bus for [`WorkerEvent`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all subscribers. Silently dropped without subscribers.
    pub fn emit(&self, event: WorkerEvent) {
        tracing::trace!(
            event_type = event.event_type(),
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
