use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::crawler::backend::Crawler;
use crate::crawler::config::{
    BackendDefaults, BrowserConfig, BuiltinKind, ConfigSpec, CrawlerConfig, FastFetchConfig,
};
use crate::crawler::runtime::PageCrawler;
use crate::error::CrawlerError;
use crate::fetcher::{HttpFetcher, PageFetcher};

/// Constructor for one crawler kind
pub trait CrawlerFactory: Send + Sync {
    fn kind(&self) -> &str;

    /// Schema of the `extra` parameters this kind accepts
    fn config_spec(&self) -> ConfigSpec;

    /// Turn raw `extra` parameters into a typed configuration
    fn parse_config(&self, extra: &Map<String, Value>) -> Result<CrawlerConfig, CrawlerError>;

    /// Build an idle instance; must not begin any work
    fn create(&self, name: &str, config: CrawlerConfig) -> Result<Arc<dyn Crawler>, CrawlerError>;
}

/// Maps kind names to factories.
///
/// Passed around explicitly; there is no process-wide instance.
pub struct Registry {
    factories: RwLock<HashMap<String, Arc<dyn CrawlerFactory>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the built-in kinds
    pub fn with_builtin_kinds(defaults: &BackendDefaults) -> Self {
        let registry = Self::new();
        let builtins: [Arc<dyn CrawlerFactory>; 2] = [
            Arc::new(FastFetchFactory::new(defaults.fast_fetch.clone())),
            Arc::new(BrowserAutomationFactory::new(defaults.browser_automation.clone())),
        ];
        for factory in builtins {
            registry.register_override(factory);
        }
        registry
    }

    /// Bind a factory to its kind, refusing to replace an existing binding
    pub fn register(&self, factory: Arc<dyn CrawlerFactory>) -> Result<(), CrawlerError> {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        let kind = factory.kind().to_string();

        if factories.contains_key(&kind) {
            return Err(CrawlerError::DuplicateKind(kind));
        }

        info!(kind = %kind, "Registered crawler kind");
        factories.insert(kind, factory);
        Ok(())
    }

    /// Bind a factory to its kind, replacing and returning any previous binding
    pub fn register_override(&self, factory: Arc<dyn CrawlerFactory>) -> Option<Arc<dyn CrawlerFactory>> {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        let kind = factory.kind().to_string();

        let previous = factories.insert(kind.clone(), factory);
        if previous.is_some() {
            warn!(kind = %kind, "Crawler kind registration overridden");
        } else {
            debug!(kind = %kind, "Registered crawler kind");
        }
        previous
    }

    pub fn unregister(&self, kind: &str) -> Result<(), CrawlerError> {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(kind)
            .map(|_| ())
            .ok_or_else(|| CrawlerError::UnknownKind(kind.to_string()))
    }

    /// Validate `extra` for `kind` without building anything
    pub fn validate(&self, kind: &str, extra: &Map<String, Value>) -> Result<CrawlerConfig, CrawlerError> {
        let config = self.factory(kind)?.parse_config(extra)?;
        config.validate()?;
        Ok(config)
    }

    /// Build an idle instance of `kind` named `name`
    pub fn create(
        &self,
        kind: &str,
        name: &str,
        extra: &Map<String, Value>,
    ) -> Result<Arc<dyn Crawler>, CrawlerError> {
        let factory = self.factory(kind)?;
        let config = factory.parse_config(extra)?;
        config.validate()?;

        let crawler = factory.create(name, config.clone())?;
        crawler.validate_config(&config)?;

        debug!(kind = %kind, crawler = %name, "Created crawler instance");
        Ok(crawler)
    }

    pub fn supported_kinds(&self) -> BTreeSet<String> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Configuration schema of a kind
    pub fn describe(&self, kind: &str) -> Result<ConfigSpec, CrawlerError> {
        Ok(self.factory(kind)?.config_spec())
    }

    fn factory(&self, kind: &str) -> Result<Arc<dyn CrawlerFactory>, CrawlerError> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
            .ok_or_else(|| CrawlerError::UnknownKind(kind.to_string()))
    }
}

/// Factory for the plain HTTP backend
pub struct FastFetchFactory {
    defaults: FastFetchConfig,
}

impl FastFetchFactory {
    pub fn new(defaults: FastFetchConfig) -> Self {
        Self { defaults }
    }
}

impl CrawlerFactory for FastFetchFactory {
    fn kind(&self) -> &str {
        BuiltinKind::FastFetch.as_str()
    }

    fn config_spec(&self) -> ConfigSpec {
        FastFetchConfig::spec(&self.defaults)
    }

    fn parse_config(&self, extra: &Map<String, Value>) -> Result<CrawlerConfig, CrawlerError> {
        Ok(CrawlerConfig::FastFetch(self.config_spec().resolve(extra)?))
    }

    fn create(&self, name: &str, config: CrawlerConfig) -> Result<Arc<dyn Crawler>, CrawlerError> {
        Ok(Arc::new(PageCrawler::new(name, self.kind(), config, Arc::new(http_fetcher))))
    }
}

fn http_fetcher(config: &CrawlerConfig) -> Result<Arc<dyn PageFetcher>, CrawlerError> {
    match config {
        CrawlerConfig::FastFetch(config) => {
            let fetcher = HttpFetcher::new(config)
                .map_err(|e| CrawlerError::Execution(format!("{:#}", e)))?;
            Ok(Arc::new(fetcher))
        }
        other => Err(CrawlerError::Config(format!(
            "HTTP fetcher cannot use a '{}' configuration",
            other.kind_name()
        ))),
    }
}

/// Factory for the WebDriver backend
pub struct BrowserAutomationFactory {
    defaults: BrowserConfig,
}

impl BrowserAutomationFactory {
    pub fn new(defaults: BrowserConfig) -> Self {
        Self { defaults }
    }
}

impl CrawlerFactory for BrowserAutomationFactory {
    fn kind(&self) -> &str {
        BuiltinKind::BrowserAutomation.as_str()
    }

    fn config_spec(&self) -> ConfigSpec {
        BrowserConfig::spec(&self.defaults)
    }

    fn parse_config(&self, extra: &Map<String, Value>) -> Result<CrawlerConfig, CrawlerError> {
        Ok(CrawlerConfig::BrowserAutomation(self.config_spec().resolve(extra)?))
    }

    fn create(&self, name: &str, config: CrawlerConfig) -> Result<Arc<dyn Crawler>, CrawlerError> {
        Ok(Arc::new(PageCrawler::new(name, self.kind(), config, Arc::new(browser_fetcher))))
    }
}

fn browser_fetcher(config: &CrawlerConfig) -> Result<Arc<dyn PageFetcher>, CrawlerError> {
    match config {
        CrawlerConfig::BrowserAutomation(config) => Ok(Arc::new(BrowserSession::new(config.clone()))),
        other => Err(CrawlerError::Config(format!(
            "browser session cannot use a '{}' configuration",
            other.kind_name()
        ))),
    }
}
