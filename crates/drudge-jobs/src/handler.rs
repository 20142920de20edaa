//! Task handlers and the task list a worker pool serves.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use drudge_core::{Job, JobSpec, JobStore, Result};

/// Context provided to task handlers.
pub struct JobContext {
    /// The job being processed. `attempts` already counts this execution.
    pub job: Job,
    /// Worker slot that holds the lock on the job.
    pub worker_id: String,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job, worker_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            store,
        }
    }

    /// Get the job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    pub fn task_identifier(&self) -> &str {
        &self.job.task_identifier
    }

    /// Whether this is the last attempt the job will get.
    pub fn is_final_attempt(&self) -> bool {
        self.job.attempts >= self.job.max_attempts
    }

    /// Enqueue a follow-up job from inside a handler.
    pub async fn add_job(&self, spec: JobSpec) -> Result<Job> {
        self.store.add_job(spec).await
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job succeeded and is removed from the store.
    Success,
    /// The job failed; the message becomes `last_error`.
    Failed(String),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}

impl<E: fmt::Display> From<std::result::Result<(), E>> for JobResult {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failed(e.to_string()),
        }
    }
}

/// Trait for task handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The task identifier this handler processes.
    fn task_identifier(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    task_identifier: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    pub fn new(task_identifier: impl Into<String>, f: F) -> Self {
        Self {
            task_identifier: task_identifier.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    fn task_identifier(&self) -> &str {
        &self.task_identifier
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.f)(ctx).await
    }
}

/// Handler that succeeds without doing anything.
pub struct NoOpHandler {
    task_identifier: String,
}

impl NoOpHandler {
    pub fn new(task_identifier: impl Into<String>) -> Self {
        Self {
            task_identifier: task_identifier.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn task_identifier(&self) -> &str {
        &self.task_identifier
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success
    }
}

/// Handlers keyed by task identifier. Immutable once a pool starts.
#[derive(Clone, Default)]
pub struct TaskList {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, replacing any previous one for the same task.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    /// Add an async closure as the handler for `task_identifier`.
    pub fn with_fn<F, Fut>(self, task_identifier: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.with_handler(FnHandler::new(task_identifier, f))
    }

    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) {
        let identifier = handler.task_identifier().to_string();
        tracing::debug!(task_identifier = %identifier, "Registered task handler");
        self.handlers.insert(identifier, Arc::new(handler));
    }

    pub fn get(&self, task_identifier: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(task_identifier).cloned()
    }

    /// Task identifiers in sorted order.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList")
            .field("tasks", &self.identifiers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drudge_db::MemoryJobStore;
    use serde_json::json;

    fn test_job(task: &str) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            queue_name: None,
            task_identifier: task.to_string(),
            payload: json!({"id": 999}),
            priority: 0,
            run_at: now,
            attempts: 1,
            max_attempts: 3,
            last_error: None,
            key: None,
            locked_at: Some(now),
            locked_by: Some("w".into()),
            flags: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn ctx(task: &str) -> JobContext {
        JobContext::new(test_job(task), "w", Arc::new(MemoryJobStore::new()))
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler::new("noop");
        assert_eq!(handler.task_identifier(), "noop");
        assert_eq!(handler.execute(ctx("noop")).await, JobResult::Success);
    }

    #[tokio::test]
    async fn test_fn_handler_sees_payload() {
        let handler = FnHandler::new("check", |ctx: JobContext| async move {
            if ctx.payload()["id"] == 999 {
                JobResult::Success
            } else {
                JobResult::Failed("wrong payload".into())
            }
        });
        assert!(handler.execute(ctx("check")).await.is_success());
    }

    #[tokio::test]
    async fn test_context_add_job_goes_to_store() {
        let store = Arc::new(MemoryJobStore::new());
        let ctx = JobContext::new(test_job("parent"), "w", store.clone());
        ctx.add_job(JobSpec::new("child", json!({}))).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[test]
    fn test_final_attempt() {
        let mut job = test_job("t");
        job.attempts = 3;
        let ctx = JobContext::new(job, "w", Arc::new(MemoryJobStore::new()));
        assert!(ctx.is_final_attempt());
    }

    #[test]
    fn test_job_result_from_result() {
        assert_eq!(JobResult::from(Ok::<(), String>(())), JobResult::Success);
        assert_eq!(
            JobResult::from(Err::<(), _>("bad input")),
            JobResult::Failed("bad input".into())
        );
    }

    #[test]
    fn test_task_list_identifiers_sorted_and_replace() {
        let tasks = TaskList::new()
            .with_handler(NoOpHandler::new("zeta"))
            .with_handler(NoOpHandler::new("alpha"))
            .with_handler(NoOpHandler::new("alpha"));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.identifiers(), vec!["alpha", "zeta"]);
        assert!(tasks.get("alpha").is_some());
        assert!(tasks.get("missing").is_none());
    }
}
