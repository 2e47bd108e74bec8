use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::orchestrator::job::Job;
use crate::storage::JobStore;

/// Process-local job store for tests and single-process runs
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;

        if let Some(stored) = jobs.get(&job.id) {
            if stored.updated_at > job.updated_at {
                debug!(job_id = %job.id, "Ignoring stale job write");
                return Ok(());
            }
        }

        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}
