//! Process settings read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use drudge_core::defaults;
use drudge_db::PoolConfig;
use drudge_jobs::{CronConfig, PoolMode, WorkerConfig};

/// Everything the worker process needs to start.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `DATABASE_URL` | required | PostgreSQL connection string |
/// | `DRUDGE_SCHEMA` | `drudge` | Schema holding the queue tables |
/// | `DRUDGE_CRONTAB` | `crontab` | Crontab file; missing means no cron |
/// | `DRUDGE_SCHEMA_ONLY` | `false` | Install the schema, then exit |
/// | `DRUDGE_HANDLE_SIGNALS` | `true` | Stop gracefully on SIGINT/SIGTERM |
/// | `DRUDGE_SHUTDOWN_DEADLINE_SECS` | `10` | Forced exit after this long |
///
/// Pool, worker and cron settings come from [`PoolConfig::from_env`],
/// [`WorkerConfig::from_env`] and [`CronConfig::from_env`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub schema: String,
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub cron: CronConfig,
    pub crontab_path: PathBuf,
    pub schema_only: bool,
    pub handle_signals: bool,
    pub shutdown_deadline: Duration,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a PostgreSQL connection string")?;
        let schema =
            std::env::var("DRUDGE_SCHEMA").unwrap_or_else(|_| defaults::SCHEMA.to_string());
        let crontab_path = std::env::var("DRUDGE_CRONTAB")
            .unwrap_or_else(|_| defaults::CRONTAB_PATH.to_string())
            .into();
        let shutdown_deadline = std::env::var("DRUDGE_SHUTDOWN_DEADLINE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::SHUTDOWN_DEADLINE_SECS);

        let settings = Self {
            database_url,
            schema,
            pool: PoolConfig::from_env(),
            worker: WorkerConfig::from_env(),
            cron: CronConfig::from_env(),
            crontab_path,
            schema_only: env_flag("DRUDGE_SCHEMA_ONLY", false),
            handle_signals: env_flag("DRUDGE_HANDLE_SIGNALS", true),
            shutdown_deadline: Duration::from_secs(shutdown_deadline),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn is_once(&self) -> bool {
        self.worker.mode == PoolMode::Once
    }

    /// Reject contradictory settings before anything connects.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("DATABASE_URL must not be empty");
        }
        if self.schema_only && self.is_once() {
            bail!("DRUDGE_SCHEMA_ONLY and DRUDGE_ONCE cannot be combined");
        }
        drudge_db::validate_schema_name(&self.schema)?;
        Ok(())
    }
}
