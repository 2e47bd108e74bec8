use anyhow::{Result, Context};
use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row, postgres::{PgPoolOptions, PgRow}};
use sqlx::types::Json;
use serde_json::Value;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cli::config::StoreSettings;
use crate::crawler::backend::CrawlerStats;
use crate::error::JobError;
use crate::orchestrator::job::{Job, JobParameters};
use crate::storage::JobStore;

/// PostgreSQL implementation of JobStore
pub struct PostgresJobStore {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema name
    schema: String,

    /// Jobs table name
    table: String,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL job store
    pub async fn new(settings: &StoreSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await
            .context(format!("Failed to connect to PostgreSQL: {}", settings.connection_string))?;

        let store = Self {
            pool,
            schema: settings.schema_name.clone(),
            table: format!("{}_jobs", settings.table_prefix),
        };

        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL job store");

        Ok(store)
    }

    /// Ensure the schema and jobs table exist
    async fn ensure_schema(&self) -> Result<()> {
        let query = format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema);

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context(format!("Failed to create schema: {}", self.schema))?;

        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                parameters JSONB NOT NULL,
                result JSONB,
                error JSONB,
                stats JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
            self.qualified_table()
        );

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context(format!("Failed to create jobs table: {}", self.table))?;

        debug!("Ensured jobs table exists: {}", self.qualified_table());

        Ok(())
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn row_to_job(row: &PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let parameters: Json<JobParameters> = row.try_get("parameters")?;
        let result: Option<Json<Value>> = row.try_get("result")?;
        let error: Option<Json<JobError>> = row.try_get("error")?;
        let stats: Json<CrawlerStats> = row.try_get("stats")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Ok(Job {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            status: status.parse()?,
            parameters: parameters.0,
            created_at,
            updated_at,
            result: result.map(|json| json.0),
            error: error.map(|json| json.0),
            stats: stats.0,
        })
    }
}

const JOB_COLUMNS: &str = "id, kind, status, parameters, result, error, stats, created_at, updated_at";

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            JOB_COLUMNS,
            self.qualified_table()
        );

        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query job from PostgreSQL")?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        // The WHERE clause keeps updated_at from moving backwards
        let query = format!(
            "INSERT INTO {} AS jobs ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE
             SET kind = EXCLUDED.kind,
                 status = EXCLUDED.status,
                 parameters = EXCLUDED.parameters,
                 result = EXCLUDED.result,
                 error = EXCLUDED.error,
                 stats = EXCLUDED.stats,
                 updated_at = EXCLUDED.updated_at
             WHERE jobs.updated_at <= EXCLUDED.updated_at",
            self.qualified_table(),
            JOB_COLUMNS
        );

        let outcome = sqlx::query(&query)
            .bind(&job.id)
            .bind(&job.kind)
            .bind(job.status.as_str())
            .bind(Json(&job.parameters))
            .bind(job.result.as_ref().map(Json))
            .bind(job.error.as_ref().map(Json))
            .bind(Json(&job.stats))
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await
            .context("Failed to store job in PostgreSQL")?;

        if outcome.rows_affected() == 0 {
            debug!(job_id = %job.id, "Ignoring stale job write");
        }

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {} FROM {} ORDER BY created_at DESC",
            JOB_COLUMNS,
            self.qualified_table()
        );

        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list jobs from PostgreSQL")?;

        rows.iter().map(Self::row_to_job).collect()
    }
}
