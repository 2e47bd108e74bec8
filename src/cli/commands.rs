use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::cli::config::AppConfig;
use crate::crawler::backend::CrawlParams;
use crate::crawler::manager::CrawlerManager;
use crate::crawler::registry::Registry;
use crate::error::CrawlerError;
use crate::orchestrator::events::{CommandType, EventMessage, StartPayload};
use crate::orchestrator::job::{Job, JobParameters, JobStatus};
use crate::orchestrator::{EventConsumer, Orchestrator};
use crate::storage::JobStoreFactory;
use crate::utils::MetricsCollector;

/// Consume lifecycle events until Ctrl-C, then stop every live job
pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let settings = &config.orchestrator;

    let registry = Arc::new(Registry::with_builtin_kinds(&config.backends));
    let store = JobStoreFactory::create(&config.store).await?;
    let broker = Broker::connect(&config.broker).await?;

    let recovered = broker.recover_in_flight().await?;
    if recovered > 0 {
        warn!("Requeued {} messages left unacknowledged by a previous worker", recovered);
    }

    let manager = Arc::new(CrawlerManager::new(settings.stop_grace, settings.status_timeout));
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        manager,
        store,
        broker.publisher(),
        settings.persistence_retry.clone(),
        MetricsCollector::new(),
    )
    .with_progress_interval(settings.progress_interval));

    let consumer = EventConsumer::new(
        broker.source(),
        orchestrator.clone(),
        settings.max_in_flight,
        settings.max_redeliveries,
    );
    let cancel = consumer.cancellation_token();
    let mut worker = tokio::spawn(async move { consumer.run().await });

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received, shutting down");
            cancel.cancel();
            (&mut worker).await
        }
        finished = &mut worker => finished,
    };

    orchestrator.shutdown().await;
    finished.context("Consumer task panicked")?
}

/// Validate and record a new job, then publish its START event
pub async fn start(
    config_path: Option<&Path>,
    domain: String,
    depth: u32,
    kind: String,
    extra: Option<String>,
    job_id: Option<String>,
) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let extra = parse_extra(extra.as_deref())?;

    // Refuse bad requests before anything is recorded
    let registry = Registry::with_builtin_kinds(&config.backends);
    registry.validate(&kind, &extra)?;
    CrawlParams::new(domain.clone(), depth).seed_url()?;

    let payload = StartPayload { domain, depth, kind, extra };
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let store = JobStoreFactory::create(&config.store).await?;
    if let Some(existing) = store.get(&job_id).await? {
        bail!("Job {} already exists ({})", job_id, existing.status);
    }

    let mut job = Job::new(job_id.clone(), JobParameters::from(payload.clone()));
    store.upsert(&job).await?;

    // Queued is recorded first so it can never overwrite a worker's later status
    job.transition(JobStatus::Queued)?;
    store.upsert(&job).await?;

    let broker = Broker::connect(&config.broker).await?;
    if let Err(e) = broker.sink().submit(&EventMessage::start(job_id.clone(), &payload)).await {
        job.fail(&CrawlerError::delivery(&e))?;
        store.upsert(&job).await?;
        return Err(e.context(format!("Failed to publish START for job {}", job_id)));
    }

    info!(job_id = %job_id, "Job queued");
    println!("{}", job_id);
    Ok(())
}

/// Publish a STOP, PAUSE or RESUME event
pub async fn submit(config_path: Option<&Path>, command: CommandType, job_id: String) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let broker = Broker::connect(&config.broker).await?;

    let message = EventMessage::new(command, job_id);
    broker.sink().submit(&message).await?;

    info!(job_id = %message.job_id, "Published {}", command.as_str());
    if let Some(message_id) = &message.message_id {
        println!("{}", message_id);
    }
    Ok(())
}

/// Print one job record, or a summary line per job
pub async fn status(config_path: Option<&Path>, job_id: Option<String>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = JobStoreFactory::create(&config.store).await?;

    match job_id {
        Some(job_id) => {
            let job = store
                .get(&job_id)
                .await?
                .ok_or_else(|| CrawlerError::NotFound(job_id.clone()))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        None => {
            let jobs = store.list().await?;
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in jobs {
                println!(
                    "{}  {:<9}  {:<18}  {}  pages={} errors={}  updated {}",
                    job.id,
                    job.status,
                    job.kind,
                    job.parameters.domain,
                    job.stats.pages_visited,
                    job.stats.errors_count,
                    job.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
    }

    Ok(())
}

/// List the registered kinds with their configuration keys
pub async fn kinds(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let registry = Registry::with_builtin_kinds(&config.backends);

    for kind in registry.supported_kinds() {
        let spec = registry.describe(&kind)?;
        println!("{}", kind);
        for field in &spec.fields {
            let default = field
                .default
                .as_ref()
                .map(|value| format!(" (default {})", value))
                .unwrap_or_default();
            let required = if field.required { " required" } else { "" };
            println!("  {:<20} {:?}{}{}", field.key, field.ty, required, default);
        }
    }

    Ok(())
}

/// Show the configuration, or write the defaults with `init`
pub async fn show_config(config_path: Option<&Path>, init: bool) -> Result<()> {
    if init {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(AppConfig::default_path);
        AppConfig::default().save_to_file(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = AppConfig::load(config_path)?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);
    Ok(())
}

/// `--extra` must be a JSON object
fn parse_extra(extra: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = extra else {
        return Ok(Map::new());
    };

    match serde_json::from_str::<Value>(raw).context("--extra is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--extra must be a JSON object, got {}", other),
    }
}
