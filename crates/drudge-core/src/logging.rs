//! Structured logging schema and field name constants for drudge.
//!
//! All crates use these names for structured logging fields so log
//! aggregation can query the pool, the cron loop and the stores uniformly.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue (job failure, transient store error) |
//! | INFO  | Lifecycle events (pool start/stop, cron schedule, runner stop) |
//! | DEBUG | Claims, completions, wake-ups |
//! | TRACE | Per-candidate decisions inside the in-memory store |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "jobs", "cron", "database", "runner"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "slot", "scheduler", "jobs", "memory_store"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim", "complete", "fail", "tick"
pub const OPERATION: &str = "op";

/// Worker pool identifier.
pub const POOL_ID: &str = "pool_id";

/// Worker (slot) identifier recorded in `locked_by`.
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job id being processed.
pub const JOB_ID: &str = "job_id";

/// Task identifier of the job.
pub const TASK_IDENTIFIER: &str = "task_identifier";

/// Queue name of the job.
pub const QUEUE_NAME: &str = "queue_name";

/// Cron item identifier.
pub const CRON_IDENTIFIER: &str = "cron_identifier";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number of the current execution.
pub const ATTEMPTS: &str = "attempts";

/// Number of jobs affected by a batch operation.
pub const JOB_COUNT: &str = "job_count";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
