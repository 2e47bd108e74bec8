use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::EventPublisher;
use crate::crawler::backend::{Crawler, RuntimeState, StatusSnapshot};
use crate::crawler::manager::{wait_until_terminal, CrawlerManager, StatusRead};
use crate::crawler::registry::Registry;
use crate::error::CrawlerError;
use crate::orchestrator::events::{CommandType, EventMessage, StatusEvent, StatusEventType};
use crate::orchestrator::job::{Job, JobStatus};
use crate::storage::JobStore;
use crate::utils::metrics::MetricsCollector;
use crate::utils::retry::RetryPolicy;

/// What handling one event did to its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job moved to this status
    Applied(JobStatus),
    /// Valid request that needed no change
    NoOp(JobStatus),
    /// The job had already finished
    Discarded(JobStatus),
}

/// A job record joined with its live instance, if any
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: Job,
    pub instance: Option<StatusRead>,
}

/// Applies lifecycle events to jobs.
///
/// Events for one job are serialized through a per-job lock; events for different jobs run
/// concurrently. Every status change is persisted before the matching status event is
/// published. Live jobs are also kept in memory, which stays authoritative for them when the
/// store cannot be written.
pub struct Orchestrator {
    registry: Arc<Registry>,
    manager: Arc<CrawlerManager>,
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn EventPublisher>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    jobs: DashMap<String, Job>,
    retry: RetryPolicy,
    metrics: MetricsCollector,
    progress_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        manager: Arc<CrawlerManager>,
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            manager,
            store,
            publisher,
            locks: DashMap::new(),
            jobs: DashMap::new(),
            retry,
            metrics,
            progress_interval: Duration::from_secs(5),
        }
    }

    /// Throttle for `CRAWLER_PROGRESS` events
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<CrawlerManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Apply one event to its job
    pub async fn handle(self: &Arc<Self>, message: EventMessage) -> Result<Outcome, CrawlerError> {
        let job_id = message.job_id.clone();
        let lock = self.lock_for(&job_id);

        let result = {
            let _guard = lock.lock().await;
            match message.command {
                CommandType::Start => self.handle_start(&message).await,
                CommandType::Stop => self.handle_stop(&job_id).await,
                CommandType::Pause => self.handle_pause(&job_id).await,
                CommandType::Resume => self.handle_resume(&job_id).await,
            }
        };
        self.release_lock(&job_id, &lock);

        match &result {
            Ok(outcome) => debug!(job_id = %job_id, command = message.command.as_str(), ?outcome, "Event handled"),
            Err(e) => warn!(job_id = %job_id, command = message.command.as_str(), "Event rejected: {}", e),
        }
        result
    }

    /// Record and live status of one job
    pub async fn get_status(&self, job_id: &str) -> Result<JobView, CrawlerError> {
        let job = self
            .load(job_id)
            .await?
            .ok_or_else(|| CrawlerError::NotFound(job_id.to_string()))?;

        let instance = match self.manager.get_status(job_id).await {
            Ok(snapshot) => Some(StatusRead::Snapshot(snapshot)),
            Err(CrawlerError::NotFound(_)) => None,
            Err(_) => Some(StatusRead::TimedOut),
        };

        Ok(JobView { job, instance })
    }

    /// Status of every live instance
    pub async fn get_all_status(&self) -> BTreeMap<String, StatusRead> {
        self.manager.get_all_status().await
    }

    /// Stop every live job and give the crawlers the grace period to finish
    pub async fn shutdown(self: &Arc<Self>) {
        let live: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().status.holds_instance())
            .map(|entry| entry.key().clone())
            .collect();

        info!("Shutting down, stopping {} live jobs", live.len());
        for job_id in &live {
            if let Err(e) = self.handle(EventMessage::new(CommandType::Stop, job_id.clone())).await {
                warn!(job_id = %job_id, "Stop during shutdown failed: {}", e);
            }
        }

        let grace = self.manager.stop_grace();
        let mut crawlers = Vec::new();
        for name in self.manager.list().await {
            if let Some(crawler) = self.manager.get(&name).await {
                crawlers.push(crawler);
            }
        }
        join_all(crawlers.iter().map(|crawler| wait_until_terminal(crawler.as_ref(), grace))).await;

        // Monitors record the final states and drop the instances
        let deadline = Instant::now() + grace;
        while !self.manager.list().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let leftover = self.manager.list().await;
        if !leftover.is_empty() {
            warn!(alert = true, "Crawlers still tracked at shutdown: {}", leftover.join(", "));
        }

        self.metrics.log_summary().await;
    }

    async fn handle_start(self: &Arc<Self>, message: &EventMessage) -> Result<Outcome, CrawlerError> {
        let job_id = &message.job_id;
        let payload = message.start_payload();

        let mut job = match self.load(job_id).await? {
            Some(job) if job.status.is_terminal() => return Ok(self.discard(&job, CommandType::Start)),
            Some(job) if job.status.holds_instance() => {
                debug!(job_id = %job_id, status = %job.status, "Duplicate START ignored");
                return Ok(Outcome::NoOp(job.status));
            }
            Some(mut job) => {
                if let Ok(payload) = payload {
                    job.parameters = payload.into();
                    job.kind = job.parameters.kind.clone();
                }
                job
            }
            None => match payload {
                Ok(payload) => Job::new(job_id.clone(), payload.into()),
                Err(e) => {
                    self.reject(job_id, "", &e).await;
                    return Err(e);
                }
            },
        };

        let params = job.parameters.crawl_params();
        let created = params
            .seed_url()
            .and_then(|_| self.registry.create(&job.kind, job_id, &job.parameters.extra));
        let crawler = match created {
            Ok(crawler) => crawler,
            Err(e) => {
                self.reject(job_id, &job.kind, &e).await;
                return Err(e);
            }
        };

        if self.manager.forget(job_id).await.is_some() {
            warn!(job_id = %job_id, "Replaced a stale crawler instance");
        }
        self.manager.add(crawler.clone(), params.clone()).await?;

        let updates = crawler.subscribe();
        let previous = job.status;

        if let Err(e) = crawler.start(params).await {
            error!(job_id = %job_id, kind = %job.kind, "Crawler failed to start: {}", e);
            self.manager.forget(job_id).await;
            job.fail(&e)?;
            self.record(&job, previous).await;
            self.metrics.record_finished(job.status.as_str()).await;
            return Ok(Outcome::Applied(JobStatus::Failed));
        }

        job.transition(JobStatus::Running)?;
        job.stats = updates.borrow().stats.clone();
        self.record(&job, previous).await;
        info!(job_id = %job_id, kind = %job.kind, domain = %job.parameters.domain, "Job running");

        self.spawn_monitor(job_id.clone(), updates);
        Ok(Outcome::Applied(JobStatus::Running))
    }

    async fn handle_stop(self: &Arc<Self>, job_id: &str) -> Result<Outcome, CrawlerError> {
        let mut job = self.require(job_id).await?;
        let previous = job.status;

        match previous {
            status if status.is_terminal() => Ok(self.discard(&job, CommandType::Stop)),
            JobStatus::Stopping => Ok(Outcome::NoOp(JobStatus::Stopping)),
            JobStatus::Pending | JobStatus::Queued => {
                job.transition(JobStatus::Stopped)?;
                self.record(&job, previous).await;
                Ok(Outcome::Applied(JobStatus::Stopped))
            }
            _ => {
                job.transition(JobStatus::Stopping)?;
                self.record(&job, previous).await;

                let Some(crawler) = self.manager.get(job_id).await else {
                    warn!(job_id = %job_id, "No live crawler for stopping job, marking stopped");
                    job.transition(JobStatus::Stopped)?;
                    self.record(&job, JobStatus::Stopping).await;
                    return Ok(Outcome::Applied(JobStatus::Stopped));
                };

                if let Err(e) = crawler.stop().await {
                    warn!(job_id = %job_id, "Crawler rejected stop: {}", e);
                }
                self.spawn_stop_watchdog(job_id.to_string(), crawler);
                Ok(Outcome::Applied(JobStatus::Stopping))
            }
        }
    }

    async fn handle_pause(&self, job_id: &str) -> Result<Outcome, CrawlerError> {
        let mut job = self.require(job_id).await?;
        if job.status.is_terminal() {
            return Ok(self.discard(&job, CommandType::Pause));
        }
        if job.status != JobStatus::Running {
            return Err(CrawlerError::invalid_state("pause", job.status));
        }

        let Some(crawler) = self.manager.get(job_id).await else {
            return self.fail_lost(job).await;
        };
        if !crawler.supports_pause() {
            return Err(CrawlerError::invalid_state("pause", format!("running a {} crawler", job.kind)));
        }

        crawler.pause().await?;
        job.transition(JobStatus::Paused)?;
        job.stats = crawler.subscribe().borrow().stats.clone();
        self.record(&job, JobStatus::Running).await;
        Ok(Outcome::Applied(JobStatus::Paused))
    }

    async fn handle_resume(&self, job_id: &str) -> Result<Outcome, CrawlerError> {
        let mut job = self.require(job_id).await?;
        if job.status.is_terminal() {
            return Ok(self.discard(&job, CommandType::Resume));
        }
        if job.status != JobStatus::Paused {
            return Err(CrawlerError::invalid_state("resume", job.status));
        }

        let Some(crawler) = self.manager.get(job_id).await else {
            return self.fail_lost(job).await;
        };

        crawler.resume().await?;
        job.transition(JobStatus::Running)?;
        self.record(&job, JobStatus::Paused).await;
        Ok(Outcome::Applied(JobStatus::Running))
    }

    /// Record the final state of a crawl that ended on its own or after a stop
    async fn finalize(&self, job_id: &str, snapshot: StatusSnapshot) {
        let lock = self.lock_for(job_id);
        {
            let _guard = lock.lock().await;

            match self.load(job_id).await {
                Ok(Some(mut job)) if !job.status.is_terminal() => {
                    let previous = job.status;
                    job.stats = snapshot.stats.clone();

                    if let Err(e) = settle(&mut job, &snapshot) {
                        error!(job_id = %job_id, "Cannot record final state {}: {}", snapshot.runtime_state, e);
                    } else {
                        info!(job_id = %job_id, status = %job.status, pages = job.stats.pages_visited, "Job finished");
                        self.record(&job, previous).await;
                        self.metrics.record_finished(job.status.as_str()).await;
                    }
                }
                Ok(_) => debug!(job_id = %job_id, "Job already final"),
                Err(e) => error!(job_id = %job_id, alert = true, "Cannot load job to finalize: {}", e),
            }

            self.manager.forget(job_id).await;
        }
        self.release_lock(job_id, &lock);
    }

    /// Mark a job stopped when its crawler ignored the stop request
    async fn force_stopped(&self, job_id: &str, crawler: &dyn Crawler) {
        let lock = self.lock_for(job_id);
        {
            let _guard = lock.lock().await;

            match self.load(job_id).await {
                Ok(Some(mut job)) if job.status == JobStatus::Stopping => {
                    job.stats = crawler.subscribe().borrow().stats.clone();
                    if job.transition(JobStatus::Stopped).is_ok() {
                        self.record(&job, JobStatus::Stopping).await;
                        self.metrics.record_finished(job.status.as_str()).await;
                    }
                    self.manager.forget(job_id).await;
                }
                Ok(_) => debug!(job_id = %job_id, "Job settled before the grace period ran out"),
                Err(e) => error!(job_id = %job_id, alert = true, "Cannot load job to force stop: {}", e),
            }
        }
        self.release_lock(job_id, &lock);
    }

    /// Follow a job's crawler: publish progress while it runs and finalize once it ends
    fn spawn_monitor(self: &Arc<Self>, job_id: String, mut updates: watch::Receiver<StatusSnapshot>) {
        let orchestrator = Arc::clone(self);
        let interval = self.progress_interval;
        tokio::spawn(async move {
            let mut reported_pages = 0;
            let mut last_report = Instant::now();

            loop {
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.runtime_state.is_terminal() {
                    orchestrator.finalize(&job_id, snapshot).await;
                    return;
                }

                let pending = snapshot.stats.pages_visited != reported_pages;
                if pending && last_report.elapsed() >= interval {
                    orchestrator.report_progress(&job_id, &snapshot).await;
                    reported_pages = snapshot.stats.pages_visited;
                    last_report = Instant::now();
                    continue;
                }

                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(last_report + interval), if pending => {}
                }
            }

            let mut snapshot = updates.borrow().clone();
            if !snapshot.runtime_state.is_terminal() {
                warn!(job_id = %job_id, state = %snapshot.runtime_state, "Crawler dropped before finishing");
                snapshot.runtime_state = RuntimeState::Error;
                snapshot.last_error = Some("crawler instance lost".into());
            }
            orchestrator.finalize(&job_id, snapshot).await;
        });
    }

    async fn report_progress(&self, job_id: &str, snapshot: &StatusSnapshot) {
        let lock = self.lock_for(job_id);
        {
            let _guard = lock.lock().await;

            let job = self.jobs.get_mut(job_id).and_then(|mut entry| {
                if entry.status.holds_instance() {
                    entry.stats = snapshot.stats.clone();
                    Some(entry.value().clone())
                } else {
                    None
                }
            });

            if let Some(job) = job {
                debug!(job_id = %job_id, pages = job.stats.pages_visited, "Crawl progress");
                self.notify(StatusEvent::new(StatusEventType::CrawlerProgress, &job)).await;
            }
        }
        self.release_lock(job_id, &lock);
    }

    fn spawn_stop_watchdog(self: &Arc<Self>, job_id: String, crawler: Arc<dyn Crawler>) {
        let orchestrator = Arc::clone(self);
        let grace = self.manager.stop_grace();
        tokio::spawn(async move {
            if wait_until_terminal(crawler.as_ref(), grace).await.is_some() {
                return;
            }

            warn!(
                job_id = %job_id,
                alert = true,
                grace_ms = grace.as_millis() as u64,
                "Crawler did not acknowledge stop within the grace period"
            );
            orchestrator.metrics.record_alert().await;
            orchestrator.force_stopped(&job_id, crawler.as_ref()).await;
        });
    }

    async fn fail_lost(&self, mut job: Job) -> Result<Outcome, CrawlerError> {
        error!(job_id = %job.id, status = %job.status, "Job has no live crawler instance");
        let previous = job.status;
        job.fail(&CrawlerError::Execution("crawler instance lost".into()))?;
        self.record(&job, previous).await;
        self.metrics.record_finished(job.status.as_str()).await;
        Ok(Outcome::Applied(JobStatus::Failed))
    }

    fn discard(&self, job: &Job, command: CommandType) -> Outcome {
        info!(job_id = %job.id, status = %job.status, "Discarding {} for finished job", command.as_str());
        Outcome::Discarded(job.status)
    }

    /// Announce a START that was refused before any record was written
    async fn reject(&self, job_id: &str, kind: &str, err: &CrawlerError) {
        warn!(job_id = %job_id, kind = %kind, "START refused: {}", err);
        self.notify(StatusEvent::rejected(job_id, kind, err)).await;
    }

    async fn require(&self, job_id: &str) -> Result<Job, CrawlerError> {
        self.load(job_id)
            .await?
            .ok_or_else(|| CrawlerError::NotFound(job_id.to_string()))
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, CrawlerError> {
        if let Some(job) = self.jobs.get(job_id) {
            return Ok(Some(job.clone()));
        }

        self.store.get(job_id).await.map_err(CrawlerError::delivery)
    }

    /// Persist, update the local view, then publish the matching status event
    async fn record(&self, job: &Job, previous: JobStatus) {
        let persisted = self.persist(job).await;

        if persisted && job.status.is_terminal() {
            self.jobs.remove(&job.id);
        } else {
            self.jobs.insert(job.id.clone(), job.clone());
        }
        if persisted {
            self.flush_unpersisted().await;
        }

        if let Some(event) = StatusEventType::for_transition(previous, job.status) {
            self.notify(StatusEvent::new(event, job)).await;
        }
    }

    /// Write final records whose persistence was exhausted earlier, then drop them from memory
    async fn flush_unpersisted(&self) {
        let stranded: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();

        for job in stranded {
            if let Err(e) = self.store.upsert(&job).await {
                debug!(job_id = %job.id, "Final record still not persisted: {:#}", e);
                return;
            }
            self.jobs
                .remove_if(&job.id, |_, current| current.updated_at == job.updated_at);
            info!(job_id = %job.id, status = %job.status, "Persisted final record after store recovery");
        }
    }

    async fn persist(&self, job: &Job) -> bool {
        let mut attempts = 0usize;
        let outcome = self
            .retry
            .run("job store write", || {
                attempts += 1;
                self.store.upsert(job)
            })
            .await;
        self.metrics.record_retries(attempts.saturating_sub(1)).await;

        match outcome {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %job.id, status = %job.status, alert = true, "Job record not persisted: {:#}", e);
                self.metrics.record_alert().await;
                false
            }
        }
    }

    async fn notify(&self, event: StatusEvent) {
        let mut attempts = 0usize;
        let outcome = self
            .retry
            .run("status publish", || {
                attempts += 1;
                self.publisher.publish(&event)
            })
            .await;
        self.metrics.record_retries(attempts.saturating_sub(1)).await;

        if let Err(e) = outcome {
            error!(job_id = %event.job_id, routing_key = %event.routing_key, alert = true, "Status event lost: {:#}", e);
            self.metrics.record_alert().await;
        }
    }

    fn lock_for(&self, job_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it
    fn release_lock(&self, job_id: &str, lock: &Arc<Mutex<()>>) {
        self.locks
            .remove_if(job_id, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) <= 2);
    }
}

/// Move `job` to the status matching the crawler's final state
fn settle(job: &mut Job, snapshot: &StatusSnapshot) -> Result<(), CrawlerError> {
    match snapshot.runtime_state {
        RuntimeState::Completed if job.status != JobStatus::Stopping => {
            if job.status == JobStatus::Paused {
                job.transition(JobStatus::Running)?;
            }
            job.transition(JobStatus::Completed)?;
            job.result = snapshot.result.clone();
            Ok(())
        }
        RuntimeState::Completed | RuntimeState::Stopped => {
            if job.status != JobStatus::Stopping {
                job.transition(JobStatus::Stopping)?;
            }
            job.transition(JobStatus::Stopped)
        }
        _ => {
            let message = snapshot
                .last_error
                .clone()
                .unwrap_or_else(|| "crawler failed".to_string());
            job.fail(&CrawlerError::Execution(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::crawler::config::BackendDefaults;
    use crate::fetcher::FetchError;
    use crate::orchestrator::events::StartPayload;
    use crate::orchestrator::job::JobParameters;
    use crate::storage::{MemoryJobStore, MockJobStore};
    use crate::testing::{example_site, ScriptedFactory, ScriptedFetcher, StalledFactory, SCRIPTED};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;

    const SEED: &str = "https://example.com/";

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        broker: Arc<MemoryBroker>,
        store: Arc<MemoryJobStore>,
        fetcher: Arc<ScriptedFetcher>,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn build(store: Arc<dyn JobStore>, fetcher: Arc<ScriptedFetcher>) -> (Arc<Orchestrator>, Arc<MemoryBroker>) {
        let registry = Registry::with_builtin_kinds(&BackendDefaults::default());
        registry.register(Arc::new(ScriptedFactory::new(fetcher))).unwrap();
        registry.register(Arc::new(StalledFactory)).unwrap();

        let broker = Arc::new(MemoryBroker::default());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(registry),
            Arc::new(CrawlerManager::new(Duration::from_millis(200), Duration::from_millis(50))),
            store,
            broker.clone(),
            fast_retry(),
            MetricsCollector::new(),
        ));
        (orchestrator, broker)
    }

    fn harness(fetcher: ScriptedFetcher) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let fetcher = Arc::new(fetcher);
        let (orchestrator, broker) = build(store.clone(), fetcher.clone());
        Harness {
            orchestrator,
            broker,
            store,
            fetcher,
        }
    }

    fn start(job_id: &str, kind: &str) -> EventMessage {
        start_with(job_id, kind, Map::new())
    }

    fn start_with(job_id: &str, kind: &str, extra: Map<String, Value>) -> EventMessage {
        EventMessage::start(
            job_id,
            &StartPayload {
                domain: "example.com".into(),
                depth: 2,
                kind: kind.into(),
                extra,
            },
        )
    }

    fn command(command: CommandType, job_id: &str) -> EventMessage {
        EventMessage::new(command, job_id)
    }

    async fn wait_for_job(store: &MemoryJobStore, job_id: &str, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = store.get(job_id).await.unwrap() {
                    if job.status == status {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach the expected status")
    }

    async fn wait_until_untracked(orchestrator: &Orchestrator, job_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.manager().get(job_id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("crawler instance was never removed");
    }

    async fn events_for(broker: &MemoryBroker, job_id: &str) -> Vec<StatusEventType> {
        broker
            .published()
            .await
            .into_iter()
            .filter(|event| event.job_id == job_id)
            .map(|event| event.event)
            .collect()
    }

    #[tokio::test]
    async fn test_crawl_runs_to_completion() {
        let h = harness(example_site());

        let outcome = h.orchestrator.handle(start("j0", SCRIPTED)).await.unwrap();
        assert_eq!(outcome, Outcome::Applied(JobStatus::Running));

        let job = wait_for_job(&h.store, "j0", JobStatus::Completed).await;
        assert_eq!(job.stats.pages_visited, 4);
        assert_eq!(job.result.as_ref().unwrap()["pages_visited"], json!(4));
        assert!(job.error.is_none());

        wait_until_untracked(&h.orchestrator, "j0").await;
        assert_eq!(
            events_for(&h.broker, "j0").await,
            vec![StatusEventType::CrawlerStarted, StatusEventType::CrawlerCompleted]
        );
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let h = harness(example_site().gated(Arc::new(Semaphore::new(0))));

        h.orchestrator.handle(start("j1", SCRIPTED)).await.unwrap();
        assert_eq!(h.store.get("j1").await.unwrap().unwrap().status, JobStatus::Running);

        let outcome = h.orchestrator.handle(command(CommandType::Stop, "j1")).await.unwrap();
        assert_eq!(outcome, Outcome::Applied(JobStatus::Stopping));

        let job = wait_for_job(&h.store, "j1", JobStatus::Stopped).await;
        assert!(job.result.is_none());
        assert!(job.error.is_none());

        wait_until_untracked(&h.orchestrator, "j1").await;
        assert_eq!(
            events_for(&h.broker, "j1").await,
            vec![
                StatusEventType::CrawlerStarted,
                StatusEventType::CrawlerStopping,
                StatusEventType::CrawlerStopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_start_is_noop() {
        let h = harness(example_site().gated(Arc::new(Semaphore::new(0))));

        h.orchestrator.handle(start("j1", SCRIPTED)).await.unwrap();
        let again = h.orchestrator.handle(start("j1", SCRIPTED)).await.unwrap();

        assert_eq!(again, Outcome::NoOp(JobStatus::Running));
        assert_eq!(h.orchestrator.manager().list().await, vec!["j1"]);
    }

    #[tokio::test]
    async fn test_concurrent_starts_create_one_instance() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(example_site().gated(gate.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move { orchestrator.handle(start("j1", SCRIPTED)).await })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Outcome::Applied(JobStatus::Running) => applied += 1,
                Outcome::NoOp(JobStatus::Running) => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(h.orchestrator.manager().list().await, vec!["j1"]);

        gate.add_permits(16);
        wait_for_job(&h.store, "j1", JobStatus::Completed).await;
        assert_eq!(h.fetcher.fetch_count(SEED), 1);
    }

    #[tokio::test]
    async fn test_stop_while_paused_passes_through_stopping() {
        let h = harness(example_site().gated(Arc::new(Semaphore::new(0))));

        h.orchestrator.handle(start("j1", SCRIPTED)).await.unwrap();
        assert_eq!(
            h.orchestrator.handle(command(CommandType::Pause, "j1")).await.unwrap(),
            Outcome::Applied(JobStatus::Paused)
        );

        let outcome = h.orchestrator.handle(command(CommandType::Stop, "j1")).await.unwrap();
        assert_eq!(outcome, Outcome::Applied(JobStatus::Stopping));

        wait_for_job(&h.store, "j1", JobStatus::Stopped).await;
        assert_eq!(
            events_for(&h.broker, "j1").await,
            vec![
                StatusEventType::CrawlerStarted,
                StatusEventType::CrawlerPaused,
                StatusEventType::CrawlerStopping,
                StatusEventType::CrawlerStopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_pause_and_resume_leave_state_unchanged() {
        let h = harness(example_site().gated(Arc::new(Semaphore::new(0))));
        h.orchestrator.handle(start("j1", SCRIPTED)).await.unwrap();

        let err = h.orchestrator.handle(command(CommandType::Resume, "j1")).await.unwrap_err();
        assert!(matches!(err, CrawlerError::InvalidState { operation: "resume", .. }));
        assert_eq!(h.store.get("j1").await.unwrap().unwrap().status, JobStatus::Running);

        h.orchestrator.handle(command(CommandType::Pause, "j1")).await.unwrap();
        let err = h.orchestrator.handle(command(CommandType::Pause, "j1")).await.unwrap_err();
        assert!(matches!(err, CrawlerError::InvalidState { operation: "pause", .. }));
        assert_eq!(h.store.get("j1").await.unwrap().unwrap().status, JobStatus::Paused);

        assert_eq!(
            h.orchestrator.handle(command(CommandType::Resume, "j1")).await.unwrap(),
            Outcome::Applied(JobStatus::Running)
        );

        let err = h.orchestrator.handle(command(CommandType::Pause, "missing")).await.unwrap_err();
        assert_eq!(err, CrawlerError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn test_pause_on_pending_job_is_invalid() {
        let h = harness(example_site());
        let job = Job::new("j4", JobParameters::from(StartPayload {
            domain: "example.com".into(),
            depth: 1,
            kind: SCRIPTED.into(),
            extra: Map::new(),
        }));
        h.store.upsert(&job).await.unwrap();

        let err = h.orchestrator.handle(command(CommandType::Pause, "j4")).await.unwrap_err();
        assert_eq!(err, CrawlerError::invalid_state("pause", JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let h = harness(example_site());

        let err = h.orchestrator.handle(start("j2", "unknown-kind")).await.unwrap_err();

        assert_eq!(err, CrawlerError::UnknownKind("unknown-kind".into()));
        assert!(h.orchestrator.manager().list().await.is_empty());
        assert!(h.store.get("j2").await.unwrap().is_none());

        let published = h.broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event, StatusEventType::CrawlerFailed);
        assert_eq!(published[0].error.as_ref().unwrap().kind, "unknown_kind");
    }

    #[tokio::test]
    async fn test_invalid_extra_is_rejected() {
        let h = harness(example_site());
        let mut extra = Map::new();
        extra.insert("max_pages".into(), json!("many"));

        let err = h.orchestrator.handle(start_with("j2", SCRIPTED, extra)).await.unwrap_err();

        assert!(matches!(err, CrawlerError::Config(_)));
        assert!(h.orchestrator.manager().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_mid_crawl() {
        let fetcher = example_site().fail("https://example.com/a", FetchError::Fatal("browser crashed".into()));
        let h = harness(fetcher);

        h.orchestrator.handle(start("j3", SCRIPTED)).await.unwrap();

        let job = wait_for_job(&h.store, "j3", JobStatus::Failed).await;
        let error = job.error.unwrap();
        assert_eq!(error.kind, "execution");
        assert!(error.message.contains("browser crashed"));
        assert!(job.result.is_none());

        wait_until_untracked(&h.orchestrator, "j3").await;
        assert_eq!(
            h.orchestrator.handle(command(CommandType::Stop, "j3")).await.unwrap(),
            Outcome::Discarded(JobStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_backend_panic_fails_job_and_frees_instance() {
        let h = harness(example_site().panic_on("https://example.com/a"));

        let outcome = h.orchestrator.handle(start("j8", SCRIPTED)).await.unwrap();
        assert_eq!(outcome, Outcome::Applied(JobStatus::Running));

        let job = wait_for_job(&h.store, "j8", JobStatus::Failed).await;
        let error = job.error.unwrap();
        assert_eq!(error.kind, "execution");
        assert!(error.message.contains("crawler panicked"));

        wait_until_untracked(&h.orchestrator, "j8").await;
        assert_eq!(
            events_for(&h.broker, "j8").await,
            vec![StatusEventType::CrawlerStarted, StatusEventType::CrawlerFailed]
        );
    }

    #[tokio::test]
    async fn test_dropped_instance_fails_job() {
        let h = harness(example_site());
        h.orchestrator.handle(start("j10", "stalled")).await.unwrap();

        assert!(h.orchestrator.manager().forget("j10").await.is_some());

        let job = wait_for_job(&h.store, "j10", JobStatus::Failed).await;
        assert!(job.error.unwrap().message.contains("crawler instance lost"));
    }

    #[tokio::test]
    async fn test_start_failure_marks_job_failed() {
        let h = harness(example_site());
        let mut extra = Map::new();
        extra.insert("fail_start".into(), json!(true));

        let outcome = h.orchestrator.handle(start_with("j5", SCRIPTED, extra)).await.unwrap();

        assert_eq!(outcome, Outcome::Applied(JobStatus::Failed));
        assert!(h.orchestrator.manager().list().await.is_empty());
        let job = h.store.get("j5").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().message.contains("refused to start"));
    }

    #[tokio::test]
    async fn test_stop_pending_job() {
        let h = harness(example_site());
        let job = Job::new("j6", JobParameters::from(StartPayload {
            domain: "example.com".into(),
            depth: 1,
            kind: SCRIPTED.into(),
            extra: Map::new(),
        }));
        h.store.upsert(&job).await.unwrap();

        let outcome = h.orchestrator.handle(command(CommandType::Stop, "j6")).await.unwrap();

        assert_eq!(outcome, Outcome::Applied(JobStatus::Stopped));
        assert_eq!(h.store.get("j6").await.unwrap().unwrap().status, JobStatus::Stopped);
        assert_eq!(
            h.orchestrator.handle(start("j6", SCRIPTED)).await.unwrap(),
            Outcome::Discarded(JobStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn test_unresponsive_crawler_is_forced_stopped() {
        let h = harness(example_site());

        h.orchestrator.handle(start("j7", "stalled")).await.unwrap();
        h.orchestrator.handle(command(CommandType::Stop, "j7")).await.unwrap();

        wait_for_job(&h.store, "j7", JobStatus::Stopped).await;
        wait_until_untracked(&h.orchestrator, "j7").await;
        assert_eq!(h.orchestrator.metrics().get_metrics().await.alerts, 1);
    }

    #[tokio::test]
    async fn test_get_status_joins_record_and_instance() {
        let h = harness(example_site().gated(Arc::new(Semaphore::new(0))));
        h.orchestrator.handle(start("j8", SCRIPTED)).await.unwrap();

        let view = h.orchestrator.get_status("j8").await.unwrap();
        assert_eq!(view.job.status, JobStatus::Running);
        match view.instance {
            Some(StatusRead::Snapshot(snapshot)) => assert_eq!(snapshot.runtime_state, RuntimeState::Running),
            other => panic!("unexpected instance status {:?}", other),
        }
        assert_eq!(h.orchestrator.get_all_status().await.len(), 1);

        assert!(matches!(
            h.orchestrator.get_status("nope").await,
            Err(CrawlerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_outage_does_not_undo_transition() {
        let mut store = MockJobStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_upsert()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));

        let fetcher = Arc::new(example_site().gated(Arc::new(Semaphore::new(0))));
        let (orchestrator, broker) = build(Arc::new(store), fetcher);

        let outcome = orchestrator.handle(start("j9", SCRIPTED)).await.unwrap();

        assert_eq!(outcome, Outcome::Applied(JobStatus::Running));
        assert_eq!(orchestrator.manager().list().await, vec!["j9"]);
        assert_eq!(orchestrator.get_status("j9").await.unwrap().job.status, JobStatus::Running);
        assert_eq!(events_for(&broker, "j9").await, vec![StatusEventType::CrawlerStarted]);

        let metrics = orchestrator.metrics().get_metrics().await;
        assert_eq!(metrics.alerts, 1);
        assert_eq!(metrics.persistence_retries, 2);
    }

    #[tokio::test]
    async fn test_store_read_failure_is_transient() {
        let mut store = MockJobStore::new();
        store
            .expect_get()
            .returning(|_| Err(anyhow::anyhow!("connection reset")));

        let (orchestrator, _broker) = build(Arc::new(store), Arc::new(example_site()));

        let err = orchestrator.handle(command(CommandType::Stop, "j10")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_final_record_written_once_store_recovers() {
        let outage = Arc::new(AtomicBool::new(true));
        let written = Arc::new(StdMutex::new(Vec::new()));

        let mut store = MockJobStore::new();
        store.expect_get().returning(|_| Ok(None));
        store.expect_upsert().returning({
            let outage = outage.clone();
            let written = written.clone();
            move |job| {
                if outage.load(Ordering::SeqCst) {
                    return Err(anyhow::anyhow!("connection refused"));
                }
                written.lock().unwrap().push(job.id.clone());
                Ok(())
            }
        });

        let fetcher = Arc::new(example_site().gated(Arc::new(Semaphore::new(0))));
        let (orchestrator, _broker) = build(Arc::new(store), fetcher);

        let mut extra = Map::new();
        extra.insert("fail_start".into(), json!(true));
        let outcome = orchestrator.handle(start_with("s1", SCRIPTED, extra)).await.unwrap();
        assert_eq!(outcome, Outcome::Applied(JobStatus::Failed));
        assert!(orchestrator.jobs.contains_key("s1"));

        outage.store(false, Ordering::SeqCst);
        orchestrator.handle(start("s2", SCRIPTED)).await.unwrap();

        assert!(!orchestrator.jobs.contains_key("s1"));
        assert!(orchestrator.jobs.contains_key("s2"));
        assert!(written.lock().unwrap().contains(&"s1".to_string()));
    }

    #[tokio::test]
    async fn test_progress_published_while_running() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(MemoryJobStore::new());
        let registry = Registry::with_builtin_kinds(&BackendDefaults::default());
        registry
            .register(Arc::new(ScriptedFactory::new(Arc::new(example_site().gated(gate.clone())))))
            .unwrap();

        let broker = Arc::new(MemoryBroker::default());
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(registry),
                Arc::new(CrawlerManager::new(Duration::from_millis(200), Duration::from_millis(50))),
                store.clone(),
                broker.clone(),
                fast_retry(),
                MetricsCollector::new(),
            )
            .with_progress_interval(Duration::ZERO),
        );

        orchestrator.handle(start("j11", SCRIPTED)).await.unwrap();
        gate.add_permits(1);

        let progress = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = broker
                    .published()
                    .await
                    .into_iter()
                    .find(|event| event.event == StatusEventType::CrawlerProgress);
                match found {
                    Some(event) => return event,
                    None => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("no progress event published");

        assert_eq!(progress.job_id, "j11");
        assert_eq!(progress.status, JobStatus::Running);
        assert_eq!(progress.stats.pages_visited, 1);
        assert_eq!(progress.routing_key, "crawler.status.progress");
        assert_eq!(store.get("j11").await.unwrap().unwrap().status, JobStatus::Running);

        orchestrator.handle(command(CommandType::Stop, "j11")).await.unwrap();
        wait_for_job(&store, "j11", JobStatus::Stopped).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_live_jobs() {
        let h = harness(example_site().gated(Arc::new(Semaphore::new(0))));
        h.orchestrator.handle(start("a", SCRIPTED)).await.unwrap();
        h.orchestrator.handle(start("b", SCRIPTED)).await.unwrap();

        h.orchestrator.shutdown().await;

        assert_eq!(h.store.get("a").await.unwrap().unwrap().status, JobStatus::Stopped);
        assert_eq!(h.store.get("b").await.unwrap().unwrap().status, JobStatus::Stopped);
        assert!(h.orchestrator.manager().list().await.is_empty());
    }
}
