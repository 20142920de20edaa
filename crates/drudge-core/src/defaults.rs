//! Centralised default values.
//!
//! Every tunable that has a default lives here so the worker, the stores and
//! the binary agree on them.

// =============================================================================
// JOBS
// =============================================================================

/// Default maximum attempts for a job before it is permanently failed.
pub const JOB_MAX_ATTEMPTS: i32 = 25;

/// Default job priority (lower runs first).
pub const JOB_PRIORITY: i32 = 0;

/// Locks older than this are considered abandoned by a crashed worker.
pub const LOCK_EXPIRY_SECS: i64 = 4 * 60 * 60;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of jobs run concurrently per process.
pub const WORKER_CONCURRENCY: usize = 1;

/// Default poll interval in milliseconds when no job is claimable.
///
/// The wake signal normally short-circuits this; the interval catches jobs
/// whose `run_at` has just passed and inserts we were not notified about.
pub const POLL_INTERVAL_MS: u64 = 2_000;

/// Delay before polling again after the store failed a claim.
pub const FETCH_ERROR_BACKOFF_MS: u64 = 1_000;

/// How many times a completion/failure report is retried on transient errors.
pub const REPORT_RETRIES: u32 = 3;

/// Delay between report retries in milliseconds.
pub const REPORT_RETRY_DELAY_MS: u64 = 200;

// =============================================================================
// RETRY / BACKOFF
// =============================================================================

/// Base retry delay in milliseconds (first retry waits roughly this long).
pub const BACKOFF_BASE_MS: u64 = 2_000;

/// Upper bound on a single retry delay in milliseconds (1 hour).
pub const BACKOFF_MAX_MS: u64 = 60 * 60 * 1_000;

/// Upper bound of the multiplicative jitter fraction.
pub const BACKOFF_JITTER_RATIO: f64 = 0.25;

// =============================================================================
// CRON
// =============================================================================

/// Cron tick granularity in seconds.
pub const CRON_GRANULARITY_SECS: i64 = 60;

/// Maximum backfill window in seconds (7 days).
pub const CRON_MAX_BACKFILL_SECS: i64 = 7 * 24 * 60 * 60;

/// Consecutive failed ticks after which the cron scheduler gives up.
pub const CRON_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default crontab file path.
pub const CRONTAB_PATH: &str = "crontab";

// =============================================================================
// DATABASE
// =============================================================================

/// Default database schema holding the job tables.
pub const SCHEMA: &str = "drudge";

/// Default maximum connections in the store's pool.
pub const MAX_POOL_SIZE: u32 = 10;

// =============================================================================
// PROCESS
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Seconds the process waits for a natural drain before exiting forcibly.
pub const SHUTDOWN_DEADLINE_SECS: u64 = 10;
