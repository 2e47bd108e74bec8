use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::crawler::config::FastFetchConfig;
use crate::fetcher::{parse_html, FetchError, FetchedPage, PageFetcher};

/// Plain HTTP fetcher used by the `fast-fetch` kind
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &FastFetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Page(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Page(format!("{} returned HTTP {}", url, status.as_u16())));
        }

        let final_url = response.url().clone();
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map_or(true, |value| value.contains("html"));

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Page(format!("failed to read body of {}: {}", url, e)))?;

        let (title, links) = if is_html {
            parse_html(&body, &final_url)
        } else {
            (String::new(), Vec::new())
        };

        debug!("Fetched {} ({} links)", final_url, links.len());

        Ok(FetchedPage {
            url: final_url.to_string(),
            status_code: status.as_u16(),
            title,
            links,
        })
    }
}
