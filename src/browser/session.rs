use anyhow::{Result, Context};
use async_trait::async_trait;
use thirtyfour::fantoccini::error::CmdError;
use thirtyfour::prelude::*;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};
use url::Url;

use crate::crawler::config::{BrowserConfig, BrowserType};
use crate::fetcher::{resolve_link, FetchError, FetchedPage, PageFetcher};

/// WebDriver-backed fetcher used by the `browser-automation` kind.
///
/// The browser session is opened lazily on the first fetch and reused for the whole crawl.
pub struct BrowserSession {
    /// Browser settings
    config: BrowserConfig,

    /// WebDriver instance
    driver: Mutex<Option<WebDriver>>,
}

impl BrowserSession {
    /// Create a new browser session
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            driver: Mutex::new(None),
        }
    }

    /// Connect to the WebDriver server with the configured capabilities
    async fn connect(&self) -> Result<WebDriver> {
        let driver = match self.config.browser {
            BrowserType::Chrome => {
                let mut caps = DesiredCapabilities::chrome();
                if self.config.headless {
                    caps.set_headless()?;
                }
                caps.add_chrome_arg(&format!(
                    "--window-size={},{}",
                    self.config.window_width, self.config.window_height
                ))?;
                caps.add_chrome_arg("--disable-dev-shm-usage")?;
                WebDriver::new(&self.config.webdriver_url, caps).await
            }
            BrowserType::Firefox => {
                let mut caps = DesiredCapabilities::firefox();
                if self.config.headless {
                    caps.set_headless()?;
                }
                WebDriver::new(&self.config.webdriver_url, caps).await
            }
        }
        .context(format!("Failed to connect to WebDriver at {}", self.config.webdriver_url))?;

        driver
            .set_page_load_timeout(Duration::from_secs(self.config.page_load_timeout_secs))
            .await?;

        debug!("Browser session initialized ({:?})", self.config.browser);

        Ok(driver)
    }

    /// Extract all links from the current page
    async fn extract_links(driver: &WebDriver, base: &Url) -> Vec<String> {
        let elements = match driver.find_all(By::Tag("a")).await {
            Ok(elements) => elements,
            Err(e) => {
                debug!("Failed to find link elements: {}", e);
                return Vec::new();
            }
        };

        let mut links = Vec::new();
        for element in elements {
            if let Ok(Some(href)) = element.attr("href").await {
                if let Some(link) = resolve_link(base, &href) {
                    links.push(link);
                }
            }
        }

        links
    }
}

/// The window is gone, the session id was rejected, or the WebDriver connection dropped
fn session_lost(e: &WebDriverError) -> bool {
    match e {
        WebDriverError::NoSuchWindow(_) => true,
        WebDriverError::CmdError(CmdError::Lost(_)) => true,
        WebDriverError::CmdError(CmdError::Standard(wd)) => wd.error() == "invalid session id",
        _ => false,
    }
}

#[async_trait]
impl PageFetcher for BrowserSession {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut guard = self.driver.lock().await;

        if guard.is_none() {
            let driver = self
                .connect()
                .await
                .map_err(|e| FetchError::Fatal(format!("{:#}", e)))?;
            *guard = Some(driver);
        }

        let driver = match guard.as_ref() {
            Some(driver) => driver,
            None => return Err(FetchError::Fatal("browser session not initialized".into())),
        };

        debug!("Navigating to: {}", url);
        if let Err(e) = driver.goto(url).await {
            return Err(if session_lost(&e) {
                FetchError::Fatal(format!("browser session lost: {}", e))
            } else {
                FetchError::Page(format!("failed to navigate to {}: {}", url, e))
            });
        }

        let current = driver
            .current_url()
            .await
            .map_err(|e| FetchError::Page(format!("failed to read current URL: {}", e)))?;

        let title = driver.title().await.unwrap_or_default();
        let links = Self::extract_links(driver, &current).await;

        Ok(FetchedPage {
            url: current.to_string(),
            // WebDriver does not expose the HTTP status of a navigation
            status_code: 200,
            title,
            links,
        })
    }

    async fn shutdown(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_loss_is_detected() {
        assert!(session_lost(&WebDriverError::NoSuchWindow("window closed".into())));

        let dropped = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(session_lost(&WebDriverError::CmdError(CmdError::Lost(dropped))));

        assert!(!session_lost(&WebDriverError::Timeout("page load".into())));
        assert!(!session_lost(&WebDriverError::NoSuchElement("a".into())));
    }
}
