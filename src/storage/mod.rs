pub mod memory;
pub mod mongo;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::cli::config::StoreSettings;
use crate::orchestrator::job::Job;

// Re-export common types
pub use memory::MemoryJobStore;
pub use mongo::MongoJobStore;
pub use postgres::PostgresJobStore;

/// Persistent job records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetch one job record
    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Insert or replace a job record; a write older than the stored one is ignored
    async fn upsert(&self, job: &Job) -> Result<()>;

    /// All job records, newest first
    async fn list(&self) -> Result<Vec<Job>>;
}

/// Factory for creating a JobStore implementation
pub struct JobStoreFactory;

impl JobStoreFactory {
    /// Create a new JobStore instance based on the settings
    pub async fn create(settings: &StoreSettings) -> Result<Arc<dyn JobStore>> {
        match settings.storage_type.as_str() {
            "postgresql" => {
                let store = PostgresJobStore::new(settings).await?;
                Ok(Arc::new(store))
            },
            "mongodb" => {
                let store = MongoJobStore::new(settings).await?;
                Ok(Arc::new(store))
            },
            "memory" => Ok(Arc::new(MemoryJobStore::new())),
            _ => {
                anyhow::bail!("Unsupported job store type: {}", settings.storage_type);
            }
        }
    }
}
