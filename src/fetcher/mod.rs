pub mod http;

use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

// Re-export common types
pub use http::HttpFetcher;

/// A fetched page reduced to what the crawl loop needs
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: String,
    pub status_code: u16,
    pub title: String,
    /// Absolute links found on the page
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// This page failed; the crawl carries on
    #[error("{0}")]
    Page(String),

    /// The fetcher itself is unusable; the crawl must end
    #[error("{0}")]
    Fatal(String),
}

/// Backend-specific page retrieval plugged into the shared crawl loop
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;

    /// Release any held resources once the crawl ends
    async fn shutdown(&self) {}
}

/// Extract the title and absolute links from an HTML document
pub fn parse_html(body: &str, base: &Url) -> (String, Vec<String>) {
    let document = Html::parse_document(body);

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .map(|node| node.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let links = match Selector::parse("a[href]") {
        Ok(selector) => document
            .select(&selector)
            .filter_map(|node| node.value().attr("href"))
            .filter_map(|href| resolve_link(base, href))
            .collect(),
        Err(_) => Vec::new(),
    };

    (title, links)
}

/// Resolve a possibly relative href against the page URL
pub fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }

    match Url::parse(href) {
        Ok(absolute) => Some(absolute.to_string()),
        Err(_) => base.join(href).ok().map(|u| u.to_string()),
    }
}
