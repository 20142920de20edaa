//! # drudge-jobs
//!
//! Job processing for the drudge queue.
//!
//! This crate provides:
//! - Task handlers and the task list a pool serves
//! - A worker pool with per-queue serialization, retries and graceful shutdown
//! - Exponential backoff with bounded jitter
//! - A cron scheduler with backfill and cross-process de-duplication
//! - A runner that owns the pool and the scheduler under one lifecycle
//!
//! ## Example
//!
//! ```ignore
//! use drudge_db::PgJobStore;
//! use drudge_jobs::{JobResult, RunnerBuilder, TaskList, WorkerConfig};
//!
//! let store = Arc::new(PgJobStore::connect(&url, "drudge", Default::default()).await?);
//! let tasks = TaskList::new().with_fn("send_email", |ctx| async move {
//!     println!("sending {}", ctx.payload());
//!     JobResult::Success
//! });
//!
//! let runner = RunnerBuilder::new(store)
//!     .with_tasks(tasks)
//!     .with_worker_config(WorkerConfig::default().with_concurrency(4))
//!     .start()
//!     .await?;
//!
//! let mut events = runner.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.event_type());
//!     }
//! });
//!
//! runner.stop().await?;
//! ```

pub mod backoff;
pub mod cron;
pub mod fetcher;
pub mod handler;
pub mod lifecycle;
pub mod runner;
pub mod worker;

// Re-export core types
pub use drudge_core::*;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use cron::{
    load_crontab_file, parse_crontab, CronConfig, CronHandle, CronItem, CronScheduler, CronState,
    Schedule,
};
pub use fetcher::JobFetcher;
pub use handler::{FnHandler, JobContext, JobHandler, JobResult, NoOpHandler, TaskList};
pub use lifecycle::Completion;
pub use runner::{run_once, Runner, RunnerBuilder, RunnerState};
pub use worker::{PoolMode, WorkerConfig, WorkerPool, WorkerPoolHandle};
