//! Error types for drudge.

use thiserror::Error;

/// Result type alias using drudge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for drudge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The job store could not be reached (connection refused, pool closed or exhausted)
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job was not locked by the reporting worker
    #[error("Job {job_id} is not locked by worker {worker_id}")]
    NotLockedBy { job_id: i64, worker_id: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Crontab could not be parsed
    #[error("Crontab error on line {line}: {message}")]
    CronParse { line: usize, message: String },

    /// Runner has already been stopped
    #[error("Runner is already stopped")]
    AlreadyStopped,

    /// Background subsystem failed and cannot continue
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same store operation later may succeed.
    ///
    /// Connection-level failures and serialization/deadlock aborts are
    /// transient; constraint violations and bad SQL are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) => true,
            Error::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                // 40001 serialization_failure, 40P01 deadlock_detected
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// An owned copy for handing one failure to several waiters.
    ///
    /// Every variant is kept except wrapped `sqlx` errors, which cannot be
    /// copied: transient ones become [`Error::StoreUnavailable`], the rest
    /// [`Error::Internal`].
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Database(e) if self.is_transient() => Error::StoreUnavailable(e.to_string()),
            Error::Database(e) => Error::Internal(format!("Database error: {e}")),
            Error::StoreUnavailable(m) => Error::StoreUnavailable(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::NotLockedBy { job_id, worker_id } => Error::NotLockedBy {
                job_id: *job_id,
                worker_id: worker_id.clone(),
            },
            Error::Serialization(m) => Error::Serialization(m.clone()),
            Error::Config(m) => Error::Config(m.clone()),
            Error::InvalidInput(m) => Error::InvalidInput(m.clone()),
            Error::CronParse { line, message } => Error::CronParse {
                line: *line,
                message: message.clone(),
            },
            Error::AlreadyStopped => Error::AlreadyStopped,
            Error::Fatal(m) => Error::Fatal(m.clone()),
            Error::Internal(m) => Error::Internal(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_store_unavailable() {
        let err = Error::StoreUnavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "Job store unavailable: connection refused");
    }

    #[test]
    fn test_error_display_not_locked_by() {
        let err = Error::NotLockedBy {
            job_id: 42,
            worker_id: "worker-a".to_string(),
        };
        assert_eq!(err.to_string(), "Job 42 is not locked by worker worker-a");
    }

    #[test]
    fn test_error_display_cron_parse() {
        let err = Error::CronParse {
            line: 3,
            message: "expected 5 time fields".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Crontab error on line 3: expected 5 time fields"
        );
    }

    #[test]
    fn test_error_display_already_stopped() {
        assert_eq!(Error::AlreadyStopped.to_string(), "Runner is already stopped");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing DATABASE_URL".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing DATABASE_URL");
    }

    #[test]
    fn test_store_unavailable_is_transient() {
        assert!(Error::StoreUnavailable("down".into()).is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(Error::Database(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_lifecycle_and_input_errors_are_not_transient() {
        assert!(!Error::AlreadyStopped.is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
        assert!(!Error::Fatal("boom".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "crontab missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("crontab missing"));
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let copy = Error::Config("bad schema".into()).duplicate();
        assert!(matches!(copy, Error::Config(ref m) if m == "bad schema"));

        let copy = Error::CronParse {
            line: 2,
            message: "bad".into(),
        }
        .duplicate();
        assert!(matches!(copy, Error::CronParse { line: 2, .. }));

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        match io.duplicate() {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("Expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_database_error_by_transience() {
        let copy = Error::Database(sqlx::Error::PoolTimedOut).duplicate();
        assert!(matches!(copy, Error::StoreUnavailable(_)));
        assert!(copy.is_transient());

        let copy = Error::Database(sqlx::Error::RowNotFound).duplicate();
        assert!(matches!(copy, Error::Internal(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
