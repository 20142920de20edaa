//! Integration tests for the worker pool against the in-memory store.
//!
//! This suite validates:
//! - Pool-001: Jobs sharing a queue never execute concurrently
//! - Pool-002: Unqueued jobs overlap up to, never beyond, the concurrency bound
//! - Pool-003: max_attempts caps executions; attempts grow by one per failure
//! - Pool-004: Retry run_at follows the backoff policy
//! - Pool-005: Once mode terminates and leaves nothing claimable
//! - Pool-006: Three jobs in one queue run one at a time in insertion order
//! - Pool-007: Graceful shutdown waits for the running job and stops claiming
//! - Pool-008: Panics and timeouts become job failures
//! - Pool-009: Inserts wake idle slots before the poll interval elapses
//! - Pool-010: 50 000 jobs across 500 queues drain in per-queue order
//! - Pool-011: An outcome that cannot be reported leaves the job locked
//! - Pool-012: Once mode honours graceful shutdown mid-job

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use drudge_db::MemoryJobStore;
use drudge_jobs::{
    run_once, BackoffPolicy, EventBus, JobContext, JobResult, JobSpec, JobStore, PoolMode,
    TaskList, WorkerConfig, WorkerEvent, WorkerPool,
};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout};

// ============================================================================
// HELPERS
// ============================================================================

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_backoff(BackoffPolicy::default().with_base(Duration::ZERO))
}

/// Tracks how many handlers run at once, overall and per queue.
#[derive(Default)]
struct Concurrency {
    running: AtomicUsize,
    peak: AtomicUsize,
    active_queues: Mutex<HashSet<String>>,
    queue_overlaps: AtomicUsize,
    order: Mutex<HashMap<String, Vec<u64>>>,
}

impl Concurrency {
    fn enter(&self, ctx: &JobContext) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(queue) = &ctx.job.queue_name {
            if !self.active_queues.lock().unwrap().insert(queue.clone()) {
                self.queue_overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let seq = ctx.payload()["seq"].as_u64().unwrap_or_default();
            self.order
                .lock()
                .unwrap()
                .entry(queue.clone())
                .or_default()
                .push(seq);
        }
    }

    fn exit(&self, ctx: &JobContext) {
        if let Some(queue) = &ctx.job.queue_name {
            self.active_queues.lock().unwrap().remove(queue);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

fn tracking_tasks(tracker: Arc<Concurrency>, work: Duration) -> TaskList {
    TaskList::new().with_fn("track", move |ctx: JobContext| {
        let tracker = tracker.clone();
        async move {
            tracker.enter(&ctx);
            sleep(work).await;
            tracker.exit(&ctx);
            JobResult::Success
        }
    })
}

async fn explode(_ctx: JobContext) -> JobResult {
    panic!("handler exploded")
}

fn failing_tasks() -> TaskList {
    TaskList::new().with_fn("always_fails", |_ctx: JobContext| async move {
        JobResult::Failed("boom".to_string())
    })
}

// ============================================================================
// QUEUE SERIALIZATION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_jobs_never_overlap_across_pools() {
    let store = Arc::new(MemoryJobStore::new());
    let specs = (0..40u64)
        .map(|seq| JobSpec::new("track", json!({ "seq": seq })).with_queue(format!("q{}", seq % 2)))
        .collect();
    store.add_jobs(specs).await.unwrap();

    let tracker = Arc::new(Concurrency::default());
    let config = fast_config().with_concurrency(4);
    let pools: Vec<_> = (0..3)
        .map(|_| {
            WorkerPool::new(
                store.clone(),
                tracking_tasks(tracker.clone(), Duration::from_millis(2)),
                config.clone().with_mode(PoolMode::Once),
            )
            .start()
        })
        .collect();
    for pool in &pools {
        pool.wait().await.unwrap();
    }

    assert_eq!(tracker.queue_overlaps.load(Ordering::SeqCst), 0);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 2, "only two queues exist");
    assert_eq!(store.pending_count().await.unwrap(), 0);
    assert_eq!(store.locked_queue_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unqueued_jobs_bounded_by_concurrency() {
    let store = Arc::new(MemoryJobStore::new());
    let specs = (0..24).map(|_| JobSpec::new("track", json!({}))).collect();
    store.add_jobs(specs).await.unwrap();

    let tracker = Arc::new(Concurrency::default());
    run_once(
        store.clone(),
        tracking_tasks(tracker.clone(), Duration::from_millis(20)),
        fast_config().with_concurrency(4),
    )
    .await
    .unwrap();

    let peak = tracker.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak {peak} exceeded concurrency");
    assert!(peak > 1, "unqueued jobs should overlap");
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_jobs_in_one_queue_run_in_order() {
    let store = Arc::new(MemoryJobStore::new());
    let now = Utc::now();
    for seq in 0..3u64 {
        store
            .add_job(
                JobSpec::new("track", json!({ "seq": seq }))
                    .with_queue("Q")
                    .with_run_at(now),
            )
            .await
            .unwrap();
    }

    let tracker = Arc::new(Concurrency::default());
    run_once(
        store.clone(),
        tracking_tasks(tracker.clone(), Duration::from_millis(10)),
        fast_config().with_concurrency(2),
    )
    .await
    .unwrap();

    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.queue_overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.order.lock().unwrap()["Q"], vec![0, 1, 2]);
    assert!(store.jobs().await.is_empty(), "all three completed");
}

// ============================================================================
// RETRIES
// ============================================================================

#[tokio::test]
async fn test_max_attempts_two_becomes_terminal() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .add_job(JobSpec::new("always_fails", json!({})).with_max_attempts(2))
        .await
        .unwrap();

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    WorkerPool::new(store.clone(), failing_tasks(), fast_config().with_mode(PoolMode::Once))
        .with_events(events)
        .start()
        .wait()
        .await
        .unwrap();

    let archived = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(archived.attempts, 2);
    assert!(archived.is_permanently_failed());
    assert!(archived.locked_by.is_none());
    assert_eq!(archived.last_error.as_deref(), Some("boom"));

    let mut attempts_seen = Vec::new();
    let mut terminal = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            WorkerEvent::JobStarted { attempts, .. } => attempts_seen.push(attempts),
            WorkerEvent::JobPermanentlyFailed { attempts, .. } => {
                assert_eq!(attempts, 2);
                terminal += 1;
            }
            _ => {}
        }
    }
    assert_eq!(attempts_seen, vec![1, 2], "one more attempt per failure");
    assert_eq!(terminal, 1);

    // No further claim succeeds for the archived job.
    run_once(store.clone(), failing_tasks(), fast_config()).await.unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_max_attempts_ceiling_for_larger_k() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .add_job(JobSpec::new("always_fails", json!({})).with_max_attempts(5))
        .await
        .unwrap();

    run_once(store.clone(), failing_tasks(), fast_config()).await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 5);
    assert_eq!(job.max_attempts, 5);
}

#[tokio::test]
async fn test_failed_job_rescheduled_by_backoff() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .add_job(JobSpec::new("always_fails", json!({})).with_max_attempts(3))
        .await
        .unwrap();

    let before = Utc::now();
    let config = WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_mode(PoolMode::Once);
    run_once(store.clone(), failing_tasks(), config).await.unwrap();

    // Default policy: 2s after the first failure, plus at most 25% jitter.
    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());
    assert!(job.run_at >= before + chrono::Duration::seconds(2));
    assert!(job.run_at <= Utc::now() + chrono::Duration::milliseconds(2500));
}

#[tokio::test]
async fn test_handler_errors_are_caught() {
    let store = Arc::new(MemoryJobStore::new());
    let panicking = store
        .add_job(JobSpec::new("panics", json!({})).with_max_attempts(1))
        .await
        .unwrap();
    let slow = store
        .add_job(JobSpec::new("slow", json!({})).with_max_attempts(1))
        .await
        .unwrap();

    let tasks = TaskList::new()
        .with_fn("panics", explode)
        .with_fn("slow", |_ctx: JobContext| async move {
            sleep(Duration::from_secs(5)).await;
            JobResult::Success
        });
    let config = fast_config()
        .with_concurrency(2)
        .with_job_timeout(Some(Duration::from_millis(50)));
    run_once(store.clone(), tasks, config).await.unwrap();

    let panicking = store.get_job(panicking.id).await.unwrap().unwrap();
    assert!(panicking
        .last_error
        .as_deref()
        .unwrap()
        .contains("handler exploded"));
    let slow = store.get_job(slow.id).await.unwrap().unwrap();
    assert!(slow.last_error.as_deref().unwrap().contains("timeout"));
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_once_mode_with_empty_store_returns() {
    let store = Arc::new(MemoryJobStore::new());
    let tracker = Arc::new(Concurrency::default());
    let result = timeout(
        Duration::from_secs(5),
        run_once(
            store,
            tracking_tasks(tracker, Duration::ZERO),
            fast_config().with_concurrency(3),
        ),
    )
    .await;
    assert!(matches!(result, Ok(Ok(()))));
}

#[tokio::test]
async fn test_once_mode_picks_up_jobs_added_by_handlers() {
    let store = Arc::new(MemoryJobStore::new());
    store
        .add_job(JobSpec::new("chain", json!({ "remaining": 3 })))
        .await
        .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let tasks = TaskList::new().with_fn("chain", move |ctx: JobContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let remaining = ctx.payload()["remaining"].as_u64().unwrap_or(0);
            if remaining > 0 {
                let next = JobSpec::new("chain", json!({ "remaining": remaining - 1 }));
                if let Err(e) = ctx.add_job(next).await {
                    return JobResult::Failed(e.to_string());
                }
            }
            JobResult::Success
        }
    });
    run_once(store.clone(), tasks, fast_config().with_concurrency(2))
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown_waits_for_running_job() {
    let store = Arc::new(MemoryJobStore::new());
    let first = store.add_job(JobSpec::new("blocking", json!({}))).await.unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let tasks = TaskList::new().with_fn("blocking", move |ctx: JobContext| {
        let started_tx = started_tx.clone();
        let gate = gate.clone();
        async move {
            let _ = started_tx.send(ctx.job.id);
            gate.notified().await;
            JobResult::Success
        }
    });

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let pool = WorkerPool::new(store.clone(), tasks, fast_config().with_concurrency(2))
        .with_events(events)
        .start();

    assert_eq!(started_rx.recv().await, Some(first.id));
    pool.graceful_shutdown("test");
    assert!(pool.is_shutting_down());

    // Work added after shutdown was requested is never claimed.
    let second = store.add_job(JobSpec::new("blocking", json!({}))).await.unwrap();
    assert!(
        timeout(Duration::from_millis(100), pool.wait()).await.is_err(),
        "pool settled while a job was still running"
    );

    release.notify_one();
    pool.wait().await.unwrap();

    assert!(store.get_job(first.id).await.unwrap().is_none(), "first job completed");
    assert_eq!(store.get_job(second.id).await.unwrap().unwrap().attempts, 0);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.event_type());
    }
    let shutdown = kinds.iter().position(|k| *k == "pool.shutdown_requested").unwrap();
    let completed = kinds.iter().position(|k| *k == "job.completed").unwrap();
    let stopped = kinds.iter().position(|k| *k == "pool.stopped").unwrap();
    assert!(shutdown < completed && completed < stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_insert_wakes_idle_slot() {
    let store = Arc::new(MemoryJobStore::new());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let tasks = TaskList::new().with_fn("ping", move |ctx: JobContext| {
        let done_tx = done_tx.clone();
        async move {
            let _ = done_tx.send(ctx.job.id);
            JobResult::Success
        }
    });
    let config = WorkerConfig::default().with_poll_interval(Duration::from_secs(60));
    let pool = WorkerPool::new(store.clone(), tasks, config).start();

    // Let the slot go idle on its first empty claim.
    sleep(Duration::from_millis(50)).await;
    let job = store.add_job(JobSpec::new("ping", json!({}))).await.unwrap();
    let seen = timeout(Duration::from_secs(5), done_rx.recv()).await.unwrap();
    assert_eq!(seen, Some(job.id));

    pool.graceful_shutdown("test");
    pool.wait().await.unwrap();
}

#[tokio::test]
async fn test_store_outage_backs_off_and_recovers() {
    let store = Arc::new(MemoryJobStore::new());
    store.add_job(JobSpec::new("track", json!({}))).await.unwrap();
    store.set_available(false);

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let tracker = Arc::new(Concurrency::default());
    let config = fast_config().with_fetch_error_backoff(Duration::from_millis(10));
    let pool = WorkerPool::new(store.clone(), tracking_tasks(tracker, Duration::ZERO), config)
        .with_events(events)
        .start();

    let failed = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(WorkerEvent::FetchFailed { .. }) = rx.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(failed.is_ok());

    store.set_available(true);
    let completed = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(WorkerEvent::JobCompleted { .. }) = rx.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(completed.is_ok());

    pool.graceful_shutdown("test");
    pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreportable_outcome_leaves_job_locked() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .add_job(JobSpec::new("cut_store", json!({})))
        .await
        .unwrap();

    let outage = store.clone();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let tasks = TaskList::new()
        .with_fn("cut_store", move |_ctx: JobContext| {
            let outage = outage.clone();
            async move {
                outage.set_available(false);
                JobResult::Success
            }
        })
        .with_fn("ping", move |ctx: JobContext| {
            let done_tx = done_tx.clone();
            async move {
                let _ = done_tx.send(ctx.job.id);
                JobResult::Success
            }
        });

    let events = EventBus::new(256);
    let mut rx = events.subscribe();
    let config = fast_config()
        .with_report_retries(2, Duration::from_millis(5))
        .with_fetch_error_backoff(Duration::from_millis(10));
    let pool = WorkerPool::new(store.clone(), tasks, config)
        .with_events(events)
        .start();

    let unreported = timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(WorkerEvent::JobReportFailed { job_id, .. }) => break job_id,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(unreported, job.id);
    assert!(!pool.is_shutting_down());

    store.set_available(true);
    let stuck = store.get_job(job.id).await.unwrap().unwrap();
    let locked_by = stuck.locked_by.unwrap();
    assert!(locked_by.starts_with(pool.id()), "locked by {locked_by}");
    assert_eq!(stuck.attempts, 1);

    // The slot survived and keeps claiming.
    let next = store.add_job(JobSpec::new("ping", json!({}))).await.unwrap();
    let seen = timeout(Duration::from_secs(5), done_rx.recv()).await.unwrap();
    assert_eq!(seen, Some(next.id));

    pool.graceful_shutdown("test");
    pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_once_mode_graceful_shutdown_finishes_running_job() {
    let store = Arc::new(MemoryJobStore::new());
    let first = store.add_job(JobSpec::new("blocking", json!({}))).await.unwrap();
    let second = store.add_job(JobSpec::new("blocking", json!({}))).await.unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let tasks = TaskList::new().with_fn("blocking", move |ctx: JobContext| {
        let started_tx = started_tx.clone();
        let gate = gate.clone();
        async move {
            let _ = started_tx.send(ctx.job.id);
            gate.notified().await;
            JobResult::Success
        }
    });

    let pool = WorkerPool::new(store.clone(), tasks, fast_config().with_mode(PoolMode::Once)).start();
    assert_eq!(started_rx.recv().await, Some(first.id));
    pool.graceful_shutdown("signal");

    release.notify_one();
    timeout(Duration::from_secs(5), pool.wait())
        .await
        .unwrap()
        .unwrap();

    assert!(store.get_job(first.id).await.unwrap().is_none(), "first job completed");
    assert_eq!(store.get_job(second.id).await.unwrap().unwrap().attempts, 0);
}

// ============================================================================
// STRESS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_thousand_jobs_across_five_hundred_queues() {
    const JOBS: u64 = 50_000;
    const QUEUES: u64 = 500;

    let store = Arc::new(MemoryJobStore::new());
    let specs = (0..JOBS)
        .map(|seq| {
            JobSpec::new("track", json!({ "seq": seq })).with_queue(format!("queue_{}", seq % QUEUES))
        })
        .collect();
    assert_eq!(store.add_jobs(specs).await.unwrap(), JOBS);

    let tracker = Arc::new(Concurrency::default());
    let pools: Vec<_> = (0..4)
        .map(|_| {
            WorkerPool::new(
                store.clone(),
                tracking_tasks(tracker.clone(), Duration::ZERO),
                fast_config().with_concurrency(4).with_mode(PoolMode::Once),
            )
            .start()
        })
        .collect();
    for pool in &pools {
        pool.wait().await.unwrap();
    }

    assert!(store.jobs().await.is_empty());
    assert_eq!(tracker.queue_overlaps.load(Ordering::SeqCst), 0);

    let order = tracker.order.lock().unwrap();
    assert_eq!(order.len(), QUEUES as usize);
    let total: usize = order.values().map(Vec::len).sum();
    assert_eq!(total, JOBS as usize);
    for (queue, seqs) in order.iter() {
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "{queue} ran out of insertion order"
        );
    }
}
