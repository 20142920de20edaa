//! Runner: one worker pool plus one cron scheduler under a single lifecycle.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

use drudge_core::{Error, EventBus, Job, JobSpec, JobStore, Result, WorkerEvent};

use crate::cron::{CronConfig, CronHandle, CronItem, CronScheduler};
use crate::handler::TaskList;
use crate::lifecycle::{completion, Completion, CompletionSender};
use crate::worker::{PoolMode, WorkerConfig, WorkerPool, WorkerPoolHandle};

/// Lifecycle of a [`Runner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Running,
    Stopping,
    Stopped,
}

/// Builder for creating a runner.
pub struct RunnerBuilder {
    store: Arc<dyn JobStore>,
    tasks: TaskList,
    worker_config: WorkerConfig,
    cron_config: CronConfig,
    crontab: Vec<CronItem>,
    events: EventBus,
}

impl RunnerBuilder {
    /// Create a new runner builder.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            tasks: TaskList::new(),
            worker_config: WorkerConfig::default(),
            cron_config: CronConfig::default(),
            crontab: Vec::new(),
            events: EventBus::default(),
        }
    }

    pub fn with_tasks(mut self, tasks: TaskList) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn with_cron_config(mut self, config: CronConfig) -> Self {
        self.cron_config = config;
        self
    }

    pub fn with_crontab(mut self, items: Vec<CronItem>) -> Self {
        self.crontab = items;
        self
    }

    /// Publish events on an existing bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Validate, register cron items and start both subsystems.
    pub async fn start(self) -> Result<Runner> {
        if self.tasks.is_empty() {
            return Err(Error::Config("No task handlers registered".to_string()));
        }

        let mut cron = CronScheduler::new(self.store.clone(), self.crontab, self.cron_config)?
            .with_events(self.events.clone());
        cron.register(Utc::now()).await?;

        let pool = WorkerPool::new(self.store.clone(), self.tasks, self.worker_config)
            .with_events(self.events.clone())
            .start();
        let cron = cron.start();

        let (state, _) = watch::channel(RunnerState::Running);
        let shared = Arc::new(RunnerShared {
            store: self.store,
            events: self.events,
            pool,
            cron,
            state,
        });
        let (tx, done) = completion();
        tokio::spawn(supervise(shared.clone(), tx));

        info!(subsystem = "runner", op = "start", "Runner started");
        Ok(Runner {
            shared,
            completion: done,
        })
    }
}

struct RunnerShared {
    store: Arc<dyn JobStore>,
    events: EventBus,
    pool: WorkerPoolHandle,
    cron: CronHandle,
    state: watch::Sender<RunnerState>,
}

impl RunnerShared {
    /// Move from Running to Stopping. False if already past Running.
    fn begin_stopping(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RunnerState::Running {
                *state = RunnerState::Stopping;
                true
            } else {
                false
            }
        })
    }

    /// Stop whichever subsystems have not settled yet.
    fn stop_subsystems(&self, reason: &str) {
        if !self.pool.completion().is_settled() {
            self.pool.graceful_shutdown(reason);
        }
        if !self.cron.completion().is_settled() {
            self.cron.stop();
        }
    }
}

/// A running worker pool and cron scheduler.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<RunnerShared>,
    completion: Completion,
}

impl Runner {
    pub fn builder(store: Arc<dyn JobStore>) -> RunnerBuilder {
        RunnerBuilder::new(store)
    }

    pub fn state(&self) -> RunnerState {
        *self.shared.state.borrow()
    }

    /// Stop both subsystems and wait for them to settle.
    ///
    /// Fails with [`Error::AlreadyStopped`] unless the runner is running.
    pub async fn stop(&self) -> Result<()> {
        if !self.shared.begin_stopping() {
            return Err(Error::AlreadyStopped);
        }
        info!(subsystem = "runner", op = "stop", "Runner stopping");
        self.shared.events.emit(WorkerEvent::Stop);
        self.shared.stop_subsystems("runner stopped");
        self.completion.wait().await
    }

    /// Resolves when the runner has stopped; fails if a subsystem failed.
    pub async fn wait(&self) -> Result<()> {
        self.completion.wait().await
    }

    /// Resolves once the runner has left `Running`, either through
    /// [`Runner::stop`] or because a subsystem settled on its own. Jobs may
    /// still be draining.
    pub async fn stopping(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s != RunnerState::Running).await;
    }

    pub async fn add_job(&self, spec: JobSpec) -> Result<Job> {
        self.shared.store.add_job(spec).await
    }

    /// Subscribe to pool, cron and runner events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    pub fn pool(&self) -> &WorkerPoolHandle {
        &self.shared.pool
    }

    pub fn cron(&self) -> &CronHandle {
        &self.shared.cron
    }
}

async fn supervise(shared: Arc<RunnerShared>, tx: CompletionSender) {
    let (first, first_result) = tokio::select! {
        r = shared.pool.wait() => ("pool", r),
        r = shared.cron.wait() => ("cron", r),
    };

    if shared.begin_stopping() {
        info!(
            subsystem = "runner",
            op = "stop",
            subsystem_settled = first,
            "Subsystem settled; stopping runner"
        );
        shared.events.emit(WorkerEvent::Stop);
    }
    shared.stop_subsystems(&format!("{first} settled"));

    let pool_result = shared.pool.wait().await;
    let cron_result = shared.cron.wait().await;
    let outcome = first_result.and(pool_result).and(cron_result);

    shared.state.send_replace(RunnerState::Stopped);
    match &outcome {
        Ok(()) => info!(subsystem = "runner", "Runner stopped"),
        Err(e) => error!(subsystem = "runner", error = %e, "Runner failed"),
    }
    tx.settle(outcome);
}

/// Process every runnable job once without cron, then return.
pub async fn run_once(
    store: Arc<dyn JobStore>,
    tasks: TaskList,
    config: WorkerConfig,
) -> Result<()> {
    if tasks.is_empty() {
        return Err(Error::Config("No task handlers registered".to_string()));
    }
    WorkerPool::new(store, tasks, config.with_mode(PoolMode::Once))
        .start()
        .wait()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;
    use drudge_db::MemoryJobStore;
    use serde_json::json;
    use std::time::Duration;

    fn tasks() -> TaskList {
        TaskList::new().with_handler(NoOpHandler::new("noop"))
    }

    #[tokio::test]
    async fn test_start_requires_tasks() {
        let store = Arc::new(MemoryJobStore::new());
        let result = RunnerBuilder::new(store).start().await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_twice_is_already_stopped() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = Runner::builder(store)
            .with_tasks(tasks())
            .with_worker_config(WorkerConfig::default().with_poll_interval(Duration::from_millis(10)))
            .start()
            .await
            .unwrap();
        assert_eq!(runner.state(), RunnerState::Running);

        runner.stop().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(matches!(runner.stop().await, Err(Error::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_add_job_passes_through() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = Runner::builder(store.clone())
            .with_tasks(tasks())
            .start()
            .await
            .unwrap();
        let job = runner.add_job(JobSpec::new("noop", json!({}))).await.unwrap();
        assert_eq!(job.task_identifier, "noop");
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_once_mode_pool_settles_runner() {
        let store = Arc::new(MemoryJobStore::new());
        store.add_job(JobSpec::new("noop", json!({}))).await.unwrap();
        let runner = Runner::builder(store.clone())
            .with_tasks(tasks())
            .with_worker_config(WorkerConfig::default().with_mode(PoolMode::Once))
            .start()
            .await
            .unwrap();

        runner.wait().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(matches!(runner.stop().await, Err(Error::AlreadyStopped)));
    }
}
