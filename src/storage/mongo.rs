use anyhow::{Result, Context};
use futures::StreamExt;
use async_trait::async_trait;
use mongodb::{Client, Database, Collection, options::{ClientOptions, FindOptions, ReplaceOptions}};
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use tracing::debug;

use crate::cli::config::StoreSettings;
use crate::orchestrator::job::Job;
use crate::storage::JobStore;

/// Duplicate key error code
const DUPLICATE_KEY: i32 = 11000;

/// MongoDB implementation of JobStore.
///
/// Each job is one document keyed by its id, with `updated_at_ms` alongside the serialized
/// record so writes can be ordered.
pub struct MongoJobStore {
    /// MongoDB database
    database: Database,

    /// Collection prefix
    collection_prefix: String,
}

impl MongoJobStore {
    /// Create a new MongoDB job store
    pub async fn new(settings: &StoreSettings) -> Result<Self> {
        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .context(format!("Failed to parse MongoDB connection string: {}", settings.connection_string))?;

        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        let database = client.database(&settings.database_name);

        // Test connection
        database.list_collection_names(None)
            .await
            .context("Failed to connect to MongoDB")?;

        debug!("Connected to MongoDB database: {}", settings.database_name);

        Ok(Self {
            database,
            collection_prefix: settings.table_prefix.clone(),
        })
    }

    /// Get the collection for job records
    fn jobs_collection(&self) -> Collection<Document> {
        self.database.collection(&format!("{}_jobs", self.collection_prefix))
    }

    fn to_document(job: &Job) -> Result<Document> {
        let mut doc = mongodb::bson::to_document(job)
            .context("Failed to convert Job to BSON document")?;
        doc.insert("_id", job.id.clone());
        doc.insert("updated_at_ms", job.updated_at.timestamp_millis());
        Ok(doc)
    }

    fn from_document(doc: Document) -> Result<Job> {
        mongodb::bson::from_document(doc).context("Failed to convert BSON document to Job")
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let result = self
            .jobs_collection()
            .find_one(doc! { "_id": job_id }, None)
            .await
            .context("Failed to query MongoDB for job")?;

        result.map(Self::from_document).transpose()
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        let doc = Self::to_document(job)?;

        // Only replace a record that is not newer than this one
        let filter = doc! {
            "_id": &job.id,
            "updated_at_ms": { "$lte": job.updated_at.timestamp_millis() },
        };

        let options = ReplaceOptions::builder().upsert(true).build();
        match self.jobs_collection().replace_one(filter, doc, options).await {
            Ok(_) => {
                debug!("Stored job: {}", job.id);
                Ok(())
            }
            // The upsert collided with a newer record under the same id
            Err(e) if matches!(
                e.kind.as_ref(),
                ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY
            ) => {
                debug!(job_id = %job.id, "Ignoring stale job write");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to store job in MongoDB"),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let options = FindOptions::builder().sort(doc! { "created_at": -1 }).build();
        let mut cursor = self
            .jobs_collection()
            .find(None, options)
            .await
            .context("Failed to query MongoDB for jobs")?;

        let mut jobs = Vec::new();
        while let Some(doc) = cursor.next().await {
            let doc = doc.context("Failed to get document from cursor")?;
            jobs.push(Self::from_document(doc)?);
        }

        Ok(jobs)
    }
}
