//! drudge-worker: runs queued jobs and cron items from a PostgreSQL schema.

mod config;
mod tasks;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drudge_db::PgJobStore;
use drudge_jobs::{load_crontab_file, Error, RunnerBuilder, WorkerPool, WorkerPoolHandle};

use crate::config::Settings;
use crate::tasks::builtin_tasks;

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "drudge=info")
fn init_tracing() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "drudge_worker=info,drudge_jobs=info,drudge_db=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("drudge-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false)); // no ANSI in files
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Cancel `token` on Ctrl+C or SIGTERM.
fn install_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
        }
        token.cancel();
    });
}

/// Await `drained`, or exit the process with status 1 once `deadline` passes.
async fn drain_within<F>(
    deadline: Duration,
    pool: &WorkerPoolHandle,
    drained: F,
) -> drudge_jobs::Result<()>
where
    F: Future<Output = drudge_jobs::Result<()>>,
{
    match tokio::time::timeout(deadline, drained).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                deadline_secs = deadline.as_secs(),
                in_flight = pool.in_flight(),
                "Graceful shutdown deadline exceeded; forcing exit"
            );
            std::process::exit(1);
        }
    }
}

fn finish(result: drudge_jobs::Result<()>) -> anyhow::Result<()> {
    match result {
        Ok(()) => {
            info!("drudge worker stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "drudge worker failed");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let _file_guard = init_tracing();

    let settings = Settings::from_env()?;
    info!(
        schema = %settings.schema,
        concurrency = settings.worker.concurrency,
        once = settings.is_once(),
        schema_only = settings.schema_only,
        "Starting drudge worker"
    );

    let store = PgJobStore::connect(
        &settings.database_url,
        &settings.schema,
        settings.pool.clone(),
    )
    .await?;
    store.install().await?;
    if settings.schema_only {
        info!(schema = %settings.schema, "Schema installed; exiting");
        return Ok(());
    }
    let store = Arc::new(store);

    let shutdown = CancellationToken::new();
    if settings.handle_signals {
        install_signal_handler(shutdown.clone());
    }

    if settings.is_once() {
        let pool = WorkerPool::new(store, builtin_tasks(), settings.worker.clone()).start();
        let result = tokio::select! {
            result = pool.wait() => result,
            _ = shutdown.cancelled() => {
                pool.graceful_shutdown("signal received");
                drain_within(settings.shutdown_deadline, &pool, pool.wait()).await
            }
        };
        return finish(result);
    }

    let listener = store.listen().await?;
    let crontab = load_crontab_file(&settings.crontab_path)?;
    let runner = RunnerBuilder::new(store.clone())
        .with_tasks(builtin_tasks())
        .with_worker_config(settings.worker.clone())
        .with_cron_config(settings.cron.clone())
        .with_crontab(crontab)
        .start()
        .await?;

    tokio::select! {
        _ = runner.stopping() => {}
        _ = shutdown.cancelled() => {}
    }
    // Either way the rest of the shutdown runs under the deadline.
    let result = drain_within(settings.shutdown_deadline, runner.pool(), async {
        match runner.stop().await {
            Err(Error::AlreadyStopped) => runner.wait().await,
            other => other,
        }
    })
    .await;
    listener.abort();

    finish(result)
}
