//! Integration tests for the cron scheduler against the in-memory store.
//!
//! This suite validates:
//! - Cron-001: Two schedulers over the same range produce one job per (item, timestamp)
//! - Cron-002: A restarted scheduler backfills the gap without duplicates
//! - Cron-003: Items registered after downtime are not backfilled before they were known
//! - Cron-004: Options from the crontab flow into produced jobs
//! - Cron-005: Repeated store failures fail the scheduler

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use drudge_db::MemoryJobStore;
use drudge_jobs::{
    parse_crontab, CronConfig, CronScheduler, CronState, Error, EventBus, JobStore, WorkerEvent,
};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
}

fn produced(jobs: &[drudge_jobs::Job]) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = jobs
        .iter()
        .map(|j| {
            (
                j.task_identifier.clone(),
                j.payload["_cron"]["ts"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    pairs.sort();
    pairs
}

#[tokio::test]
async fn test_concurrent_schedulers_are_idempotent() {
    let store = Arc::new(MemoryJobStore::new());
    let items = parse_crontab("*/5 * * * * report ?fill=1h\n* * * * * ping\n").unwrap();

    let mut a = CronScheduler::new(store.clone(), items.clone(), CronConfig::default()).unwrap();
    let mut b = CronScheduler::new(store.clone(), items, CronConfig::default()).unwrap();
    a.register(at(0, 0)).await.unwrap();
    b.register(at(0, 0)).await.unwrap();

    for minute in 1..=20 {
        let now = at(0, minute);
        a.tick_at(now).await.unwrap();
        b.tick_at(now).await.unwrap();
    }
    // Running the same range again produces nothing new.
    a.tick_at(at(0, 20)).await.unwrap();

    let jobs = store.jobs().await;
    let pairs = produced(&jobs);
    let unique: HashSet<_> = pairs.iter().cloned().collect();
    assert_eq!(pairs.len(), unique.len(), "duplicate (item, timestamp) pair");
    assert_eq!(jobs.iter().filter(|j| j.task_identifier == "ping").count(), 20);
    assert_eq!(jobs.iter().filter(|j| j.task_identifier == "report").count(), 4);
}

#[tokio::test]
async fn test_restart_backfills_gap_once() {
    let store = Arc::new(MemoryJobStore::new());
    let items = parse_crontab("*/10 * * * * digest ?fill=2h").unwrap();

    let mut first = CronScheduler::new(store.clone(), items.clone(), CronConfig::default()).unwrap();
    first.register(at(0, 0)).await.unwrap();
    assert_eq!(first.tick_at(at(0, 10)).await.unwrap(), 1);
    drop(first);

    // Down from 00:10 to 01:00.
    let mut second = CronScheduler::new(store.clone(), items.clone(), CronConfig::default()).unwrap();
    second.register(at(1, 0)).await.unwrap();
    assert_eq!(second.tick_at(at(1, 0)).await.unwrap(), 5);

    // A third instance replaying the same window adds nothing.
    let mut third = CronScheduler::new(store.clone(), items, CronConfig::default()).unwrap();
    third.register(at(1, 0)).await.unwrap();
    assert_eq!(third.tick_at(at(1, 0)).await.unwrap(), 0);

    let jobs = store.jobs().await;
    assert_eq!(jobs.len(), 6);
    let backfilled = jobs
        .iter()
        .filter(|j| j.payload["_cron"]["backfilled"] == true)
        .count();
    assert_eq!(backfilled, 4, "00:20 through 00:50 were missed");

    let known = store.known_crontab("digest").await.unwrap();
    assert_eq!(known.known_since, at(0, 0));
    assert_eq!(known.last_execution, Some(at(1, 0)));
}

#[tokio::test]
async fn test_new_item_not_backfilled_before_known() {
    let store = Arc::new(MemoryJobStore::new());
    let items = parse_crontab("* * * * * fresh ?fill=1d").unwrap();
    let mut cron = CronScheduler::new(store.clone(), items, CronConfig::default()).unwrap();
    cron.register(at(3, 0)).await.unwrap();

    assert_eq!(cron.tick_at(at(3, 0)).await.unwrap(), 0);
    assert_eq!(cron.tick_at(at(3, 2)).await.unwrap(), 2);
}

#[tokio::test]
async fn test_crontab_options_flow_into_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    let items = parse_crontab(
        r#"0 * * * * sync ?id=hourly_sync&queue=sync&max=4&priority=2 {"source": "crm"}"#,
    )
    .unwrap();
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let mut cron = CronScheduler::new(store.clone(), items, CronConfig::default())
        .unwrap()
        .with_events(events);
    cron.register(at(0, 30)).await.unwrap();
    assert_eq!(cron.tick_at(at(1, 0)).await.unwrap(), 1);

    let job = store.jobs().await.pop().unwrap();
    assert_eq!(job.task_identifier, "sync");
    assert_eq!(job.queue_name.as_deref(), Some("sync"));
    assert_eq!(job.max_attempts, 4);
    assert_eq!(job.priority, 2);
    assert_eq!(job.run_at, at(1, 0));
    assert_eq!(job.payload["source"], "crm");
    assert_eq!(job.payload["_cron"]["backfilled"], false);
    assert!(store.known_crontab("hourly_sync").await.is_some());

    match rx.try_recv().unwrap() {
        WorkerEvent::CronJobsScheduled {
            timestamp,
            job_count,
            backfilled,
        } => {
            assert_eq!(timestamp, at(1, 0));
            assert_eq!(job_count, 1);
            assert!(!backfilled);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_repeated_failures_fail_scheduler() {
    let store = Arc::new(MemoryJobStore::new());
    let items = parse_crontab("* * * * * ping").unwrap();
    let config = CronConfig::default()
        .with_granularity(Duration::from_millis(5))
        .with_max_consecutive_failures(3);
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let mut cron = CronScheduler::new(store.clone(), items, config)
        .unwrap()
        .with_events(events);
    cron.register(Utc::now() - chrono::Duration::minutes(2)).await.unwrap();
    store.set_available(false);

    let handle = cron.start();
    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Fatal(_))));
    assert_eq!(handle.state(), CronState::Stopped);

    let mut failures = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let WorkerEvent::CronTickFailed { consecutive, .. } = event {
            failures.push(consecutive);
        }
    }
    assert_eq!(failures, vec![1, 2, 3]);

    store.set_available(true);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}
