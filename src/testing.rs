//! Scripted backends shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{watch, Semaphore};

use crate::crawler::backend::{CrawlParams, Crawler, RuntimeState, StatusSnapshot};
use crate::crawler::config::{ConfigSpec, CrawlerConfig, CustomConfig, FieldSpec, FieldType};
use crate::crawler::registry::CrawlerFactory;
use crate::crawler::runtime::{FetcherBuilder, PageCrawler};
use crate::error::CrawlerError;
use crate::fetcher::{FetchError, FetchedPage, PageFetcher};

pub const SCRIPTED: &str = "scripted";

/// Fetcher that serves a fixed site map, optionally held back by a semaphore
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: HashMap<String, Vec<String>>,
    failures: HashMap<String, FetchError>,
    panics: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    fetched: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, links: &[&str]) -> Self {
        self.pages
            .insert(url.to_string(), links.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn fail(mut self, url: &str, error: FetchError) -> Self {
        self.failures.insert(url.to_string(), error);
        self
    }

    /// Fetching `url` panics inside the crawl task
    pub fn panic_on(mut self, url: &str) -> Self {
        self.panics.insert(url.to_string());
        self
    }

    /// Every fetch consumes one permit from `gate`
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetched.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn builder(self: Arc<Self>) -> FetcherBuilder {
        Arc::new(move |config: &CrawlerConfig| {
            let broken = match config {
                CrawlerConfig::Custom(custom) => custom
                    .settings
                    .get("fail_start")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                _ => false,
            };
            if broken {
                return Err(CrawlerError::Execution("backend refused to start".into()));
            }
            Ok(self.clone() as Arc<dyn PageFetcher>)
        })
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| FetchError::Fatal("gate closed".into()))?
                .forget();
        }
        self.fetched.lock().unwrap().push(url.to_string());

        if self.panics.contains(url) {
            panic!("scripted fetcher crashed on {}", url);
        }

        if let Some(error) = self.failures.get(url) {
            return Err(error.clone());
        }

        match self.pages.get(url) {
            Some(links) => Ok(FetchedPage {
                url: url.to_string(),
                status_code: 200,
                title: format!("Title of {}", url),
                links: links.clone(),
            }),
            None => Err(FetchError::Page(format!("{} returned HTTP 404", url))),
        }
    }
}

/// Default site used by the orchestration tests
pub fn example_site() -> ScriptedFetcher {
    ScriptedFetcher::new()
        .page("https://example.com/", &["https://example.com/a", "https://example.com/b"])
        .page("https://example.com/a", &["https://example.com/c"])
        .page("https://example.com/b", &[])
        .page("https://example.com/c", &[])
}

pub fn scripted_config() -> CrawlerConfig {
    CrawlerConfig::Custom(CustomConfig {
        kind: SCRIPTED.to_string(),
        settings: Map::new(),
    })
}

/// Factory for the `scripted` kind backed by a shared `ScriptedFetcher`
pub struct ScriptedFactory {
    fetcher: Arc<ScriptedFetcher>,
}

impl ScriptedFactory {
    pub fn new(fetcher: Arc<ScriptedFetcher>) -> Self {
        Self { fetcher }
    }
}

impl CrawlerFactory for ScriptedFactory {
    fn kind(&self) -> &str {
        SCRIPTED
    }

    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new(
            SCRIPTED,
            vec![
                FieldSpec::optional("max_pages", FieldType::Integer, 100),
                FieldSpec::optional("fail_start", FieldType::Boolean, false),
            ],
        )
    }

    fn parse_config(&self, extra: &Map<String, Value>) -> Result<CrawlerConfig, CrawlerError> {
        let spec = self.config_spec();
        spec.check(extra)?;
        Ok(CrawlerConfig::Custom(CustomConfig {
            kind: SCRIPTED.to_string(),
            settings: spec.apply(extra),
        }))
    }

    fn create(&self, name: &str, config: CrawlerConfig) -> Result<Arc<dyn Crawler>, CrawlerError> {
        Ok(Arc::new(PageCrawler::new(
            name,
            SCRIPTED,
            config,
            self.fetcher.clone().builder(),
        )))
    }
}

/// Crawler whose status read never returns
pub struct StalledCrawler {
    name: String,
    status: watch::Sender<StatusSnapshot>,
}

impl StalledCrawler {
    pub fn new(name: &str) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::idle(name, "stalled"));
        Self {
            name: name.to_string(),
            status,
        }
    }
}

#[async_trait]
impl Crawler for StalledCrawler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "stalled"
    }

    fn validate_config(&self, _config: &CrawlerConfig) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn configure(&self, _config: CrawlerConfig) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn start(&self, _params: CrawlParams) -> Result<(), CrawlerError> {
        self.status.send_modify(|s| s.runtime_state = RuntimeState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn pause(&self) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), CrawlerError> {
        Ok(())
    }

    async fn get_status(&self) -> StatusSnapshot {
        std::future::pending().await
    }

    fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }
}

/// Wait (bounded) until `crawler` publishes `state`
pub async fn wait_for_state(crawler: &dyn Crawler, state: RuntimeState) -> StatusSnapshot {
    let mut rx = crawler.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.runtime_state == state))
        .await
        .expect("timed out waiting for crawler state")
        .expect("status channel closed")
        .clone();
    snapshot
}

/// Factory for the `stalled` kind, whose instances ignore stop requests
pub struct StalledFactory;

impl CrawlerFactory for StalledFactory {
    fn kind(&self) -> &str {
        "stalled"
    }

    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new("stalled", vec![])
    }

    fn parse_config(&self, extra: &Map<String, Value>) -> Result<CrawlerConfig, CrawlerError> {
        self.config_spec().check(extra)?;
        Ok(CrawlerConfig::Custom(CustomConfig {
            kind: "stalled".to_string(),
            settings: Map::new(),
        }))
    }

    fn create(&self, name: &str, _config: CrawlerConfig) -> Result<Arc<dyn Crawler>, CrawlerError> {
        Ok(Arc::new(StalledCrawler::new(name)))
    }
}
