//! Claim requests issued on behalf of one worker slot.

use std::sync::Arc;

use tracing::{debug, trace};

use drudge_core::{ClaimRequest, Job, JobStore, Result};

/// Claims jobs from the store for a single worker id.
///
/// The claim result is authoritative: a job returned here is locked by this
/// worker and counted as an attempt, whatever happens to it afterwards.
pub struct JobFetcher {
    store: Arc<dyn JobStore>,
    request: ClaimRequest,
}

impl JobFetcher {
    pub fn new(store: Arc<dyn JobStore>, request: ClaimRequest) -> Self {
        Self { store, request }
    }

    pub fn worker_id(&self) -> &str {
        &self.request.worker_id
    }

    pub fn request(&self) -> &ClaimRequest {
        &self.request
    }

    /// Claim up to `batch_size` jobs, at most one per queue.
    pub async fn fetch(&self, batch_size: usize) -> Result<Vec<Job>> {
        let jobs = self.store.claim_jobs(&self.request, batch_size).await?;
        if jobs.is_empty() {
            trace!(worker_id = %self.request.worker_id, "No job available");
        } else {
            debug!(
                worker_id = %self.request.worker_id,
                job_count = jobs.len(),
                "Fetched jobs"
            );
        }
        Ok(jobs)
    }

    /// Claim a single job.
    pub async fn fetch_one(&self) -> Result<Option<Job>> {
        Ok(self.fetch(1).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_core::JobSpec;
    use drudge_db::MemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_only_known_tasks() {
        let store = Arc::new(MemoryJobStore::new());
        store.add_job(JobSpec::new("unknown", json!({}))).await.unwrap();
        let known = store.add_job(JobSpec::new("known", json!({}))).await.unwrap();

        let fetcher = JobFetcher::new(
            store.clone(),
            ClaimRequest::new("w").with_task_identifiers(vec!["known".into()]),
        );
        let job = fetcher.fetch_one().await.unwrap().unwrap();
        assert_eq!(job.id, known.id);
        assert_eq!(job.locked_by.as_deref(), Some("w"));
        assert!(fetcher.fetch_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_propagates_unavailable() {
        let store = Arc::new(MemoryJobStore::new());
        store.set_available(false);
        let fetcher = JobFetcher::new(store.clone(), ClaimRequest::new("w"));
        assert!(fetcher.fetch(4).await.unwrap_err().is_transient());
    }
}
