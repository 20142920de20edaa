//! Cron scheduler loop: turns due cron items into jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drudge_core::{defaults, CronJobEntry, Error, EventBus, JobStore, KnownCrontab, Result, WorkerEvent};

use super::crontab::{validate_items, CronItem};
use super::schedule::floor_minute;
use crate::lifecycle::{completion, Completion, CompletionSender};

/// Configuration for the cron scheduler.
#[derive(Debug, Clone)]
pub struct CronConfig {
    /// Tick period. Ticks land on multiples of this since the epoch.
    pub granularity: Duration,
    /// Upper bound on how far back any item is backfilled.
    pub max_backfill: chrono::Duration,
    /// Consecutive failed ticks before the scheduler gives up.
    pub max_consecutive_failures: u32,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            granularity: Duration::from_secs(defaults::CRON_GRANULARITY_SECS as u64),
            max_backfill: chrono::Duration::seconds(defaults::CRON_MAX_BACKFILL_SECS),
            max_consecutive_failures: defaults::CRON_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl CronConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DRUDGE_CRON_MAX_BACKFILL_SECS` | `604800` | Backfill cap |
    /// | `DRUDGE_CRON_MAX_FAILURES` | `5` | Failed ticks before giving up |
    pub fn from_env() -> Self {
        let default = Self::default();
        let max_backfill = std::env::var("DRUDGE_CRON_MAX_BACKFILL_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|secs| *secs >= 0)
            .map(chrono::Duration::seconds)
            .unwrap_or(default.max_backfill);
        let max_consecutive_failures = std::env::var("DRUDGE_CRON_MAX_FAILURES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(default.max_consecutive_failures);
        Self {
            max_backfill,
            max_consecutive_failures,
            ..default
        }
    }

    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_backfill(mut self, max_backfill: chrono::Duration) -> Self {
        self.max_backfill = max_backfill;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }
}

/// Where the scheduler is in its tick cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronState {
    Idle,
    ComputingDue,
    Inserting,
    Stopped,
}

/// Produces jobs for due cron items, at most once per (item, timestamp).
pub struct CronScheduler {
    store: Arc<dyn JobStore>,
    items: Vec<CronItem>,
    config: CronConfig,
    events: EventBus,
    known: HashMap<String, KnownCrontab>,
    started_at: Option<DateTime<Utc>>,
    last_tick: Option<DateTime<Utc>>,
    state: watch::Sender<CronState>,
}

impl CronScheduler {
    pub fn new(store: Arc<dyn JobStore>, items: Vec<CronItem>, config: CronConfig) -> Result<Self> {
        validate_items(&items)?;
        let (state, _) = watch::channel(CronState::Idle);
        Ok(Self {
            store,
            items,
            config,
            events: EventBus::default(),
            known: HashMap::new(),
            started_at: None,
            last_tick: None,
            state,
        })
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn items(&self) -> &[CronItem] {
        &self.items
    }

    pub fn state(&self) -> CronState {
        *self.state.borrow()
    }

    fn set_state(&self, state: CronState) {
        self.state.send_replace(state);
    }

    /// Record every item with the store so backfill never reaches before
    /// the first time an identifier was seen.
    pub async fn register(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.started_at = Some(now);
        if self.items.is_empty() {
            return Ok(());
        }
        let identifiers: Vec<String> = self.items.iter().map(|i| i.identifier.clone()).collect();
        let known = self.store.register_crontabs(&identifiers, now).await?;
        debug!(
            subsystem = "cron",
            component = "scheduler",
            op = "register",
            item_count = known.len(),
            "Registered cron items"
        );
        self.known = known.into_iter().map(|k| (k.identifier.clone(), k)).collect();
        Ok(())
    }

    /// Every (item, timestamp) due at `now`, in ascending timestamp order.
    pub fn due_entries(&self, now: DateTime<Utc>) -> Vec<CronJobEntry> {
        let tick = floor_minute(now);
        let cap = now - self.config.max_backfill;
        let previous = self.last_tick.or(self.started_at).unwrap_or(now);

        let mut entries = Vec::new();
        for item in &self.items {
            let known = self.known.get(&item.identifier);
            let mut lower = if item.backfills() {
                let fill = item.options.backfill_period.min(self.config.max_backfill);
                let mut lower = now - fill;
                if let Some(known) = known {
                    lower = lower.max(known.known_since);
                }
                lower
            } else {
                previous
            };
            if let Some(last) = known.and_then(|k| k.last_execution) {
                lower = lower.max(last);
            }
            lower = lower.max(cap);

            for ts in item.schedule.timestamps_between(lower, now) {
                entries.push(CronJobEntry {
                    identifier: item.identifier.clone(),
                    timestamp: ts,
                    spec: item.to_job_spec(ts, ts < tick),
                });
            }
        }
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        entries
    }

    /// Run one tick as of `now`. Returns the number of jobs inserted.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<usize> {
        self.set_state(CronState::ComputingDue);
        let entries = self.due_entries(now);
        if entries.is_empty() {
            self.last_tick = Some(now);
            self.set_state(CronState::Idle);
            return Ok(0);
        }

        self.set_state(CronState::Inserting);
        let result = self.insert(&entries, floor_minute(now)).await;
        self.set_state(CronState::Idle);
        let inserted = result?;
        self.last_tick = Some(now);
        Ok(inserted)
    }

    async fn insert(&mut self, entries: &[CronJobEntry], tick: DateTime<Utc>) -> Result<usize> {
        let mut inserted = 0;
        let mut start = 0;
        while start < entries.len() {
            let timestamp = entries[start].timestamp;
            let end = entries[start..]
                .iter()
                .position(|e| e.timestamp != timestamp)
                .map_or(entries.len(), |p| start + p);
            let group = &entries[start..end];

            let count = self.store.schedule_cron_jobs(group).await?;
            for entry in group {
                let known = self
                    .known
                    .entry(entry.identifier.clone())
                    .or_insert_with(|| KnownCrontab {
                        identifier: entry.identifier.clone(),
                        known_since: entry.timestamp,
                        last_execution: None,
                    });
                if known.last_execution.map_or(true, |last| last < timestamp) {
                    known.last_execution = Some(timestamp);
                }
            }

            if count > 0 {
                let backfilled = timestamp < tick;
                info!(
                    subsystem = "cron",
                    component = "scheduler",
                    op = "schedule",
                    timestamp = %timestamp,
                    job_count = count,
                    backfilled,
                    "Scheduled cron jobs"
                );
                self.events.emit(WorkerEvent::CronJobsScheduled {
                    timestamp,
                    job_count: count,
                    backfilled,
                });
            }
            inserted += count;
            start = end;
        }
        Ok(inserted)
    }

    /// Spawn the tick loop. Call [`register`](Self::register) first.
    pub fn start(self) -> CronHandle {
        let cancel = CancellationToken::new();
        let state = self.state.subscribe();
        let (tx, done) = completion();
        tokio::spawn(self.run(cancel.clone(), tx));
        CronHandle {
            cancel,
            state,
            completion: done,
        }
    }

    async fn run(mut self, cancel: CancellationToken, tx: CompletionSender) {
        info!(
            subsystem = "cron",
            component = "scheduler",
            op = "start",
            item_count = self.items.len(),
            "Cron scheduler started"
        );

        let outcome = if self.items.is_empty() {
            cancel.cancelled().await;
            Ok(())
        } else {
            self.tick_loop(&cancel).await
        };

        self.set_state(CronState::Stopped);
        self.events.emit(WorkerEvent::CronStopped);
        match &outcome {
            Ok(()) => info!(subsystem = "cron", component = "scheduler", "Cron scheduler stopped"),
            Err(e) => error!(
                subsystem = "cron",
                component = "scheduler",
                error = %e,
                "Cron scheduler failed"
            ),
        }
        tx.settle(outcome);
    }

    async fn tick_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut failures = 0u32;
        // First tick runs immediately so missed timestamps are backfilled at startup.
        loop {
            match self.tick_at(Utc::now()).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(
                        subsystem = "cron",
                        component = "scheduler",
                        op = "tick",
                        error = %e,
                        consecutive = failures,
                        "Cron tick failed"
                    );
                    self.events.emit(WorkerEvent::CronTickFailed {
                        error: e.to_string(),
                        consecutive: failures,
                    });
                    if failures >= self.config.max_consecutive_failures {
                        return Err(Error::Fatal(format!(
                            "Cron scheduler failed {failures} consecutive ticks: {e}"
                        )));
                    }
                }
            }

            let wait = until_next_boundary(Utc::now(), self.config.granularity);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Time from `now` to the next multiple of `granularity` since the epoch.
pub fn until_next_boundary(now: DateTime<Utc>, granularity: Duration) -> Duration {
    let step = (granularity.as_millis() as i64).max(1);
    let ms = now.timestamp_millis();
    let next = (ms.div_euclid(step) + 1) * step;
    Duration::from_millis((next - ms) as u64)
}

/// Handle for a running cron scheduler.
#[derive(Clone)]
pub struct CronHandle {
    cancel: CancellationToken,
    state: watch::Receiver<CronState>,
    completion: Completion,
}

impl CronHandle {
    /// Ask the loop to stop after any tick in progress.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> CronState {
        *self.state.borrow()
    }

    pub async fn wait(&self) -> Result<()> {
        self.completion.wait().await
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}
