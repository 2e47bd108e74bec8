use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

/// A single page visit scheduled inside a running crawl
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    /// URL to fetch
    pub url: String,

    /// Distance from the seed page (0 for the seed)
    pub depth: u32,

    /// Page that linked here (None for the seed)
    pub parent_url: Option<String>,
}

impl CrawlTask {
    pub fn seed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            depth: 0,
            parent_url: None,
        }
    }

    /// Task for a link discovered on this page
    pub fn child(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            depth: self.depth + 1,
            parent_url: Some(self.url.clone()),
        }
    }
}

/// Summary of a visited page, collected into the job result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub depth: u32,
    pub status_code: u16,
    pub title: String,
    pub links_found: usize,
    pub crawled_at: DateTime<Utc>,
}
