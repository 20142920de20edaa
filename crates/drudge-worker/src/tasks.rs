//! Tasks shipped with the worker binary.

use async_trait::async_trait;
use tracing::info;

use drudge_jobs::{JobContext, JobHandler, JobResult, NoOpHandler, TaskList};

/// Logs a line when the payload's `id` is 999. Used for smoke tests.
pub struct LogIf999Handler;

#[async_trait]
impl JobHandler for LogIf999Handler {
    fn task_identifier(&self) -> &str {
        "log_if_999"
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        if ctx.payload().get("id").and_then(|v| v.as_i64()) == Some(999) {
            info!(
                subsystem = "jobs",
                job_id = ctx.job.id,
                task_identifier = ctx.task_identifier(),
                "Found id 999"
            );
        }
        JobResult::Success
    }
}

/// Every task this binary can run.
pub fn builtin_tasks() -> TaskList {
    TaskList::new()
        .with_handler(LogIf999Handler)
        .with_handler(NoOpHandler::new("noop"))
}
