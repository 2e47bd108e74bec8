use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::CrawlerError;

/// Backend kinds that ship with the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    /// Plain HTTP fetches parsed with an HTML parser
    FastFetch,
    /// Pages rendered through a WebDriver-controlled browser
    BrowserAutomation,
}

impl BuiltinKind {
    pub const ALL: [BuiltinKind; 2] = [BuiltinKind::FastFetch, BuiltinKind::BrowserAutomation];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinKind::FastFetch => "fast-fetch",
            BuiltinKind::BrowserAutomation => "browser-automation",
        }
    }
}

impl fmt::Display for BuiltinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuiltinKind {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuiltinKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CrawlerError::UnknownKind(s.to_string()))
    }
}

/// JSON type accepted for a configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    StringList,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::StringList => value
                .as_array()
                .map_or(false, |items| items.iter().all(Value::is_string)),
        }
    }
}

/// One key of a per-kind configuration schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(key: &str, ty: FieldType) -> Self {
        Self {
            key: key.to_string(),
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(key: &str, ty: FieldType, default: impl Serialize) -> Self {
        Self {
            key: key.to_string(),
            ty,
            required: false,
            default: serde_json::to_value(default).ok(),
        }
    }
}

/// Schema for the backend-specific `extra` parameters of one kind.
///
/// Shared by the submission boundary (checked before a START is published) and by
/// `Crawler::validate_config` before execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSpec {
    pub kind: String,
    pub fields: Vec<FieldSpec>,
}

impl ConfigSpec {
    pub fn new(kind: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            kind: kind.into(),
            fields,
        }
    }

    /// Reject unknown keys, missing required keys and mistyped values
    pub fn check(&self, extra: &Map<String, Value>) -> Result<(), CrawlerError> {
        if let Some(key) = extra
            .keys()
            .find(|key| !self.fields.iter().any(|f| &f.key == *key))
        {
            return Err(CrawlerError::Config(format!(
                "unknown key '{}' for kind '{}'",
                key, self.kind
            )));
        }

        for field in &self.fields {
            match extra.get(&field.key) {
                Some(value) if !field.ty.accepts(value) => {
                    return Err(CrawlerError::Config(format!(
                        "key '{}' must be of type {:?}",
                        field.key, field.ty
                    )));
                }
                None if field.required => {
                    return Err(CrawlerError::Config(format!(
                        "missing required key '{}' for kind '{}'",
                        field.key, self.kind
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Defaults overlaid with the caller's values
    pub fn apply(&self, extra: &Map<String, Value>) -> Map<String, Value> {
        let mut merged: Map<String, Value> = self
            .fields
            .iter()
            .filter_map(|f| f.default.clone().map(|v| (f.key.clone(), v)))
            .collect();
        merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Check, merge defaults and deserialize into a typed configuration
    pub fn resolve<T: DeserializeOwned>(&self, extra: &Map<String, Value>) -> Result<T, CrawlerError> {
        self.check(extra)?;
        serde_json::from_value(Value::Object(self.apply(extra)))
            .map_err(|e| CrawlerError::Config(format!("{} ({})", e, self.kind)))
    }
}

/// Settings for the plain HTTP backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FastFetchConfig {
    /// Delay between fetch batches in milliseconds
    pub request_delay_ms: u64,
    /// Pages fetched concurrently per batch
    pub max_concurrency: usize,
    pub max_pages: usize,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for FastFetchConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: 500,
            max_concurrency: 4,
            max_pages: 200,
            user_agent: "Mozilla/5.0 (compatible; CrawlOrchestrator/0.1)".to_string(),
            request_timeout_secs: 30,
            include_patterns: vec![],
            exclude_patterns: vec![r"^.*\.(jpg|jpeg|png|gif|svg|css|js|zip|pdf)$".to_string()],
        }
    }
}

impl FastFetchConfig {
    /// Schema whose defaults are taken from `defaults`
    pub fn spec(defaults: &Self) -> ConfigSpec {
        ConfigSpec::new(
            BuiltinKind::FastFetch.as_str(),
            vec![
                FieldSpec::optional("request_delay_ms", FieldType::Integer, defaults.request_delay_ms),
                FieldSpec::optional("max_concurrency", FieldType::Integer, defaults.max_concurrency),
                FieldSpec::optional("max_pages", FieldType::Integer, defaults.max_pages),
                FieldSpec::optional("user_agent", FieldType::String, &defaults.user_agent),
                FieldSpec::optional("request_timeout_secs", FieldType::Integer, defaults.request_timeout_secs),
                FieldSpec::optional("include_patterns", FieldType::StringList, &defaults.include_patterns),
                FieldSpec::optional("exclude_patterns", FieldType::StringList, &defaults.exclude_patterns),
            ],
        )
    }

    pub fn validate(&self) -> Result<(), CrawlerError> {
        if self.max_concurrency == 0 {
            return Err(CrawlerError::Config("max_concurrency must be at least 1".into()));
        }
        if self.max_pages == 0 {
            return Err(CrawlerError::Config("max_pages must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(CrawlerError::Config("request_timeout_secs must be at least 1".into()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(CrawlerError::Config("user_agent must not be empty".into()));
        }
        validate_patterns(&self.include_patterns)?;
        validate_patterns(&self.exclude_patterns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    Chrome,
    Firefox,
}

/// Settings for the WebDriver backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub browser: BrowserType,
    pub headless: bool,
    pub page_load_timeout_secs: u64,
    pub window_width: u32,
    pub window_height: u32,
    pub request_delay_ms: u64,
    pub max_pages: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            browser: BrowserType::Chrome,
            headless: true,
            page_load_timeout_secs: 30,
            window_width: 1920,
            window_height: 1080,
            request_delay_ms: 1000,
            max_pages: 50,
            include_patterns: vec![],
            exclude_patterns: vec![],
        }
    }
}

impl BrowserConfig {
    pub fn spec(defaults: &Self) -> ConfigSpec {
        ConfigSpec::new(
            BuiltinKind::BrowserAutomation.as_str(),
            vec![
                FieldSpec::optional("webdriver_url", FieldType::String, &defaults.webdriver_url),
                FieldSpec::optional("browser", FieldType::String, defaults.browser),
                FieldSpec::optional("headless", FieldType::Boolean, defaults.headless),
                FieldSpec::optional("page_load_timeout_secs", FieldType::Integer, defaults.page_load_timeout_secs),
                FieldSpec::optional("window_width", FieldType::Integer, defaults.window_width),
                FieldSpec::optional("window_height", FieldType::Integer, defaults.window_height),
                FieldSpec::optional("request_delay_ms", FieldType::Integer, defaults.request_delay_ms),
                FieldSpec::optional("max_pages", FieldType::Integer, defaults.max_pages),
                FieldSpec::optional("include_patterns", FieldType::StringList, &defaults.include_patterns),
                FieldSpec::optional("exclude_patterns", FieldType::StringList, &defaults.exclude_patterns),
            ],
        )
    }

    pub fn validate(&self) -> Result<(), CrawlerError> {
        Url::parse(&self.webdriver_url).map_err(|e| {
            CrawlerError::Config(format!("webdriver_url '{}' is invalid: {}", self.webdriver_url, e))
        })?;
        if self.window_width == 0 || self.window_height == 0 {
            return Err(CrawlerError::Config("window size must be non-zero".into()));
        }
        if self.max_pages == 0 {
            return Err(CrawlerError::Config("max_pages must be at least 1".into()));
        }
        validate_patterns(&self.include_patterns)?;
        validate_patterns(&self.exclude_patterns)
    }
}

/// Startup defaults for the built-in kinds, overridden per job by `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendDefaults {
    pub fast_fetch: FastFetchConfig,
    pub browser_automation: BrowserConfig,
}

/// Configuration of an externally registered kind, validated by its own factory
#[derive(Debug, Clone, PartialEq)]
pub struct CustomConfig {
    pub kind: String,
    pub settings: Map<String, Value>,
}

/// Validated configuration, one variant per backend family
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlerConfig {
    FastFetch(FastFetchConfig),
    BrowserAutomation(BrowserConfig),
    Custom(CustomConfig),
}

impl CrawlerConfig {
    pub fn kind_name(&self) -> &str {
        match self {
            CrawlerConfig::FastFetch(_) => BuiltinKind::FastFetch.as_str(),
            CrawlerConfig::BrowserAutomation(_) => BuiltinKind::BrowserAutomation.as_str(),
            CrawlerConfig::Custom(custom) => &custom.kind,
        }
    }

    pub fn validate(&self) -> Result<(), CrawlerError> {
        match self {
            CrawlerConfig::FastFetch(config) => config.validate(),
            CrawlerConfig::BrowserAutomation(config) => config.validate(),
            CrawlerConfig::Custom(_) => Ok(()),
        }
    }

    /// Pacing and frontier settings used by the shared crawl loop
    pub fn crawl_settings(&self) -> CrawlSettings {
        match self {
            CrawlerConfig::FastFetch(c) => CrawlSettings {
                request_delay: Duration::from_millis(c.request_delay_ms),
                max_pages: c.max_pages,
                concurrency: c.max_concurrency,
                include_patterns: c.include_patterns.clone(),
                exclude_patterns: c.exclude_patterns.clone(),
            },
            CrawlerConfig::BrowserAutomation(c) => CrawlSettings {
                request_delay: Duration::from_millis(c.request_delay_ms),
                max_pages: c.max_pages,
                concurrency: 1,
                include_patterns: c.include_patterns.clone(),
                exclude_patterns: c.exclude_patterns.clone(),
            },
            CrawlerConfig::Custom(c) => {
                let number = |key: &str, default: u64| {
                    c.settings.get(key).and_then(Value::as_u64).unwrap_or(default)
                };
                CrawlSettings {
                    request_delay: Duration::from_millis(number("request_delay_ms", 0)),
                    max_pages: number("max_pages", 100) as usize,
                    concurrency: number("max_concurrency", 1).max(1) as usize,
                    include_patterns: vec![],
                    exclude_patterns: vec![],
                }
            }
        }
    }
}

/// Knobs of the shared crawl loop
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlSettings {
    pub request_delay: Duration,
    pub max_pages: usize,
    pub concurrency: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

fn validate_patterns(patterns: &[String]) -> Result<(), CrawlerError> {
    for pattern in patterns {
        Regex::new(pattern)
            .map_err(|e| CrawlerError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
    }
    Ok(())
}
