use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::crawler::backend::{CrawlParams, Crawler, CrawlerStats, RuntimeState, StatusSnapshot};
use crate::crawler::config::{CrawlSettings, CrawlerConfig};
use crate::crawler::scheduler::Scheduler;
use crate::crawler::task::PageRecord;
use crate::error::CrawlerError;
use crate::fetcher::{FetchError, PageFetcher};

/// Builds the page fetcher for one crawl from the instance's configuration
pub type FetcherBuilder =
    Arc<dyn Fn(&CrawlerConfig) -> Result<Arc<dyn PageFetcher>, CrawlerError> + Send + Sync>;

/// Lifecycle commands delivered to the crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Stop,
}

/// Handle on the task running the current crawl
struct Lifecycle {
    commands: mpsc::UnboundedSender<Command>,
    _handle: JoinHandle<()>,
}

/// Crawler backend built on the shared breadth-first crawl loop.
///
/// Each built-in kind is a `PageCrawler` with its own fetcher. Control calls update the
/// published state right away and forward a command to the crawl task, which polls for
/// commands between fetch batches and during delays.
pub struct PageCrawler {
    name: String,
    kind: String,
    config: Mutex<CrawlerConfig>,
    build_fetcher: FetcherBuilder,
    lifecycle: Mutex<Option<Lifecycle>>,
    status: watch::Sender<StatusSnapshot>,
}

impl PageCrawler {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        config: CrawlerConfig,
        build_fetcher: FetcherBuilder,
    ) -> Self {
        let name = name.into();
        let kind = kind.into();
        let (status, _) = watch::channel(StatusSnapshot::idle(&name, &kind));

        Self {
            name,
            kind,
            config: Mutex::new(config),
            build_fetcher,
            lifecycle: Mutex::new(None),
            status,
        }
    }

    fn state(&self) -> RuntimeState {
        self.status.borrow().runtime_state
    }

    /// Forward a command to the crawl task, if one is running
    fn send(lifecycle: &Option<Lifecycle>, command: Command) {
        if let Some(lifecycle) = lifecycle {
            // The task may already have exited; its final state is already published
            let _ = lifecycle.commands.send(command);
        }
    }
}

#[async_trait]
impl Crawler for PageCrawler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn validate_config(&self, config: &CrawlerConfig) -> Result<(), CrawlerError> {
        if config.kind_name() != self.kind {
            return Err(CrawlerError::Config(format!(
                "configuration for kind '{}' given to a '{}' crawler",
                config.kind_name(),
                self.kind
            )));
        }
        config.validate()
    }

    async fn configure(&self, config: CrawlerConfig) -> Result<(), CrawlerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().is_active() {
            return Err(CrawlerError::Config(format!(
                "crawler '{}' cannot be reconfigured while {}",
                self.name,
                self.state()
            )));
        }

        self.validate_config(&config)?;
        *self.config.lock().await = config;
        Ok(())
    }

    async fn start(&self, params: CrawlParams) -> Result<(), CrawlerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state.is_active() {
            debug!(crawler = %self.name, "Start ignored, crawler is already {}", state);
            return Ok(());
        }
        if state.is_terminal() {
            return Err(CrawlerError::invalid_state("start", state));
        }

        let config = self.config.lock().await.clone();
        self.validate_config(&config)?;
        let seed = params.seed_url()?;
        let fetcher = (self.build_fetcher)(&config)?;
        let settings = config.crawl_settings();

        let (commands, receiver) = mpsc::unbounded_channel();
        self.status.send_modify(|snapshot| {
            snapshot.runtime_state = RuntimeState::Running;
            snapshot.stats = CrawlerStats {
                started_at: Some(Utc::now()),
                ..CrawlerStats::default()
            };
            snapshot.last_error = None;
            snapshot.result = None;
        });

        info!(crawler = %self.name, kind = %self.kind, seed = %seed, depth = params.depth, "Crawl started");

        let run = CrawlRun {
            name: self.name.clone(),
            fetcher,
            seed,
            depth: params.depth,
            settings,
            status: self.status.clone(),
            control: Control {
                commands: receiver,
                paused: false,
            },
        };
        let handle = tokio::spawn(run.execute());

        *lifecycle = Some(Lifecycle {
            commands,
            _handle: handle,
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), CrawlerError> {
        let lifecycle = self.lifecycle.lock().await;

        let mut previous = RuntimeState::Idle;
        let requested = self.status.send_if_modified(|snapshot| {
            previous = snapshot.runtime_state;
            match snapshot.runtime_state {
                RuntimeState::Running | RuntimeState::Paused => {
                    snapshot.runtime_state = RuntimeState::Stopping;
                    true
                }
                RuntimeState::Idle => {
                    snapshot.runtime_state = RuntimeState::Stopped;
                    true
                }
                _ => false,
            }
        });

        if requested && previous.is_active() {
            info!(crawler = %self.name, "Stop requested");
            Self::send(&lifecycle, Command::Stop);
        }

        Ok(())
    }

    async fn pause(&self) -> Result<(), CrawlerError> {
        let lifecycle = self.lifecycle.lock().await;

        if !self.supports_pause() {
            return Err(CrawlerError::invalid_state("pause", format!("{} (unsupported)", self.state())));
        }

        let mut current = RuntimeState::Idle;
        let paused = self.status.send_if_modified(|snapshot| {
            current = snapshot.runtime_state;
            if snapshot.runtime_state == RuntimeState::Running {
                snapshot.runtime_state = RuntimeState::Paused;
                true
            } else {
                false
            }
        });

        if !paused {
            return Err(CrawlerError::invalid_state("pause", current));
        }

        info!(crawler = %self.name, "Crawl paused");
        Self::send(&lifecycle, Command::Pause);
        Ok(())
    }

    async fn resume(&self) -> Result<(), CrawlerError> {
        let lifecycle = self.lifecycle.lock().await;

        let mut current = RuntimeState::Idle;
        let resumed = self.status.send_if_modified(|snapshot| {
            current = snapshot.runtime_state;
            if snapshot.runtime_state == RuntimeState::Paused {
                snapshot.runtime_state = RuntimeState::Running;
                true
            } else {
                false
            }
        });

        if !resumed {
            return Err(CrawlerError::invalid_state("resume", current));
        }

        info!(crawler = %self.name, "Crawl resumed");
        Self::send(&lifecycle, Command::Resume);
        Ok(())
    }

    async fn get_status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }
}

/// Command receiver owned by the crawl task
struct Control {
    commands: mpsc::UnboundedReceiver<Command>,
    paused: bool,
}

impl Control {
    /// Apply one command, returning false once the crawl must end
    fn apply(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Pause) => {
                self.paused = true;
                true
            }
            Some(Command::Resume) => {
                self.paused = false;
                true
            }
            // A dropped sender means the instance itself is gone
            Some(Command::Stop) | None => false,
        }
    }

    /// Drain pending commands and park while paused
    async fn checkpoint(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.apply(Some(command)) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }

        while self.paused {
            let command = self.commands.recv().await;
            if !self.apply(command) {
                return false;
            }
        }

        true
    }

    /// Wait out the politeness delay while staying responsive to commands
    async fn sleep(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.checkpoint().await;
        }

        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return self.checkpoint().await,
                command = self.commands.recv() => {
                    if !self.apply(command) {
                        return false;
                    }
                    if self.paused && !self.checkpoint().await {
                        return false;
                    }
                }
            }
        }
    }
}

enum Outcome {
    Completed(Value),
    Stopped,
    Failed(String),
}

/// Everything the crawl task owns
struct CrawlRun {
    name: String,
    fetcher: Arc<dyn PageFetcher>,
    seed: Url,
    depth: u32,
    settings: CrawlSettings,
    status: watch::Sender<StatusSnapshot>,
    control: Control,
}

impl CrawlRun {
    async fn execute(mut self) {
        let crawled = AssertUnwindSafe(self.crawl()).catch_unwind().await;
        let outcome = match crawled {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(crawler = %self.name, alert = true, "Crawl task panicked: {}", message);
                Outcome::Failed(format!("crawler panicked: {}", message))
            }
        };
        self.fetcher.shutdown().await;

        let name = self.name;
        self.status.send_modify(|snapshot| {
            snapshot.stats.finished_at = Some(Utc::now());
            match outcome {
                // Work that ran out after a stop request still counts as stopped
                Outcome::Completed(_) if snapshot.runtime_state == RuntimeState::Stopping => {
                    snapshot.runtime_state = RuntimeState::Stopped;
                }
                Outcome::Completed(result) => {
                    snapshot.runtime_state = RuntimeState::Completed;
                    snapshot.result = Some(result);
                }
                Outcome::Stopped => snapshot.runtime_state = RuntimeState::Stopped,
                Outcome::Failed(message) => {
                    snapshot.runtime_state = RuntimeState::Error;
                    snapshot.last_error = Some(message);
                }
            }
            info!(
                crawler = %name,
                state = %snapshot.runtime_state,
                pages = snapshot.stats.pages_visited,
                errors = snapshot.stats.errors_count,
                "Crawl finished"
            );
        });
    }

    async fn crawl(&mut self) -> Outcome {
        let settings = &self.settings;
        let mut scheduler = Scheduler::new(
            &self.seed,
            self.depth,
            &settings.include_patterns,
            &settings.exclude_patterns,
        );
        let mut pages: Vec<PageRecord> = Vec::new();

        while !scheduler.is_exhausted() && pages.len() < settings.max_pages {
            if !self.control.checkpoint().await {
                return Outcome::Stopped;
            }

            let room = settings.max_pages - pages.len();
            let batch = scheduler.next_batch(settings.concurrency.min(room));

            let fetcher = self.fetcher.as_ref();
            let fetches = join_all(batch.iter().map(|task| fetcher.fetch(&task.url)));
            tokio::pin!(fetches);

            let results = loop {
                tokio::select! {
                    results = &mut fetches => break results,
                    command = self.control.commands.recv() => {
                        if !self.control.apply(command) {
                            return Outcome::Stopped;
                        }
                    }
                }
            };

            for (task, result) in batch.iter().zip(results) {
                match result {
                    Ok(page) => {
                        let queued = scheduler.enqueue_links(task, &page.links);
                        debug!(
                            crawler = %self.name,
                            url = %page.url,
                            depth = task.depth,
                            queued,
                            "Page visited"
                        );
                        pages.push(PageRecord {
                            url: page.url,
                            depth: task.depth,
                            status_code: page.status_code,
                            title: page.title,
                            links_found: page.links.len(),
                            crawled_at: Utc::now(),
                        });
                        self.status.send_modify(|snapshot| {
                            snapshot.stats.pages_visited += 1;
                            snapshot.stats.items_produced += 1;
                        });
                    }
                    Err(FetchError::Fatal(message)) => return Outcome::Failed(message),
                    Err(FetchError::Page(message)) if task.depth == 0 => {
                        return Outcome::Failed(format!("seed page failed: {}", message));
                    }
                    Err(FetchError::Page(message)) => {
                        warn!(crawler = %self.name, url = %task.url, "Page failed: {}", message);
                        self.status.send_modify(|snapshot| {
                            snapshot.stats.errors_count += 1;
                            snapshot.last_error = Some(message);
                        });
                    }
                }
            }

            if !scheduler.is_exhausted()
                && pages.len() < settings.max_pages
                && !self.control.sleep(settings.request_delay).await
            {
                return Outcome::Stopped;
            }
        }

        Outcome::Completed(json!({
            "seed": self.seed.as_str(),
            "pages_visited": pages.len(),
            "pages": pages,
        }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
