use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::crawler::backend::{CrawlParams, Crawler, RuntimeState, StatusSnapshot};
use crate::error::CrawlerError;

/// Outcome of reading one instance's status under a deadline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "read", rename_all = "snake_case")]
pub enum StatusRead {
    Snapshot(StatusSnapshot),
    TimedOut,
}

struct ManagedCrawler {
    crawler: Arc<dyn Crawler>,
    params: CrawlParams,
}

/// Tracks live crawler instances by name
pub struct CrawlerManager {
    crawlers: RwLock<HashMap<String, ManagedCrawler>>,

    /// How long `remove` waits for a stop to be acknowledged
    stop_grace: Duration,

    /// Per-instance deadline for status reads
    status_timeout: Duration,
}

impl CrawlerManager {
    pub fn new(stop_grace: Duration, status_timeout: Duration) -> Self {
        Self {
            crawlers: RwLock::new(HashMap::new()),
            stop_grace,
            status_timeout,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Track an instance along with the parameters it runs with
    pub async fn add(&self, crawler: Arc<dyn Crawler>, params: CrawlParams) -> Result<(), CrawlerError> {
        let mut crawlers = self.crawlers.write().await;
        let name = crawler.name().to_string();

        if crawlers.contains_key(&name) {
            return Err(CrawlerError::AlreadyExists(name));
        }

        debug!(crawler = %name, "Added crawler to manager");
        crawlers.insert(name, ManagedCrawler { crawler, params });
        Ok(())
    }

    /// Stop the instance if it is live, wait up to the grace period, then forget it
    pub async fn remove(&self, name: &str) -> Result<Arc<dyn Crawler>, CrawlerError> {
        let crawler = self
            .get(name)
            .await
            .ok_or_else(|| CrawlerError::NotFound(name.to_string()))?;

        let state = crawler.subscribe().borrow().runtime_state;
        if state.is_active() {
            if let Err(e) = crawler.stop().await {
                warn!(crawler = %name, "Stop during removal failed: {}", e);
            }
            if wait_until_terminal(crawler.as_ref(), self.stop_grace).await.is_none() {
                warn!(
                    crawler = %name,
                    alert = true,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "Crawler did not stop within the grace period, removing anyway"
                );
            }
        }

        self.crawlers.write().await.remove(name);
        debug!(crawler = %name, "Removed crawler from manager");
        Ok(crawler)
    }

    /// Drop the instance without stopping it
    pub async fn forget(&self, name: &str) -> Option<Arc<dyn Crawler>> {
        let removed = self.crawlers.write().await.remove(name);
        if removed.is_some() {
            debug!(crawler = %name, "Forgot crawler");
        }
        removed.map(|managed| managed.crawler)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Crawler>> {
        self.crawlers
            .read()
            .await
            .get(name)
            .map(|managed| managed.crawler.clone())
    }

    /// Names of all tracked instances
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.crawlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of instances with work scheduled or in progress
    pub async fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .crawlers
            .read()
            .await
            .iter()
            .filter(|(_, managed)| managed.crawler.subscribe().borrow().runtime_state.is_active())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn get_status(&self, name: &str) -> Result<StatusSnapshot, CrawlerError> {
        let crawler = self
            .get(name)
            .await
            .ok_or_else(|| CrawlerError::NotFound(name.to_string()))?;

        timeout(self.status_timeout, crawler.get_status())
            .await
            .map_err(|_| CrawlerError::Execution(format!("status read for '{}' timed out", name)))
    }

    /// Status of every instance; a slow instance is reported as timed out
    pub async fn get_all_status(&self) -> BTreeMap<String, StatusRead> {
        let crawlers = self.snapshot().await;
        let deadline = self.status_timeout;

        let reads = crawlers.into_iter().map(|(name, crawler)| async move {
            let read = match timeout(deadline, crawler.get_status()).await {
                Ok(snapshot) => StatusRead::Snapshot(snapshot),
                Err(_) => {
                    warn!(crawler = %name, "Status read timed out");
                    StatusRead::TimedOut
                }
            };
            (name, read)
        });

        join_all(reads).await.into_iter().collect()
    }

    pub async fn start_all(&self) -> BTreeMap<String, Result<(), CrawlerError>> {
        let crawlers: Vec<(String, Arc<dyn Crawler>, CrawlParams)> = self
            .crawlers
            .read()
            .await
            .iter()
            .map(|(name, managed)| (name.clone(), managed.crawler.clone(), managed.params.clone()))
            .collect();

        info!("Starting {} crawlers", crawlers.len());
        let starts = crawlers.into_iter().map(|(name, crawler, params)| async move {
            (name, crawler.start(params).await)
        });

        join_all(starts).await.into_iter().collect()
    }

    pub async fn stop_all(&self) -> BTreeMap<String, Result<(), CrawlerError>> {
        let crawlers = self.snapshot().await;

        info!("Stopping {} crawlers", crawlers.len());
        let stops = crawlers
            .into_iter()
            .map(|(name, crawler)| async move { (name, crawler.stop().await) });

        join_all(stops).await.into_iter().collect()
    }

    /// Pause every running instance; idle or finished ones are skipped
    pub async fn pause_all(&self) -> BTreeMap<String, Result<(), CrawlerError>> {
        let crawlers = self.snapshot().await;

        let pauses = crawlers
            .into_iter()
            .filter(|(_, crawler)| crawler.subscribe().borrow().runtime_state == RuntimeState::Running)
            .map(|(name, crawler)| async move { (name, crawler.pause().await) });

        join_all(pauses).await.into_iter().collect()
    }

    async fn snapshot(&self) -> Vec<(String, Arc<dyn Crawler>)> {
        self.crawlers
            .read()
            .await
            .iter()
            .map(|(name, managed)| (name.clone(), managed.crawler.clone()))
            .collect()
    }
}

/// Wait up to `limit` for `crawler` to reach a terminal state
pub async fn wait_until_terminal(crawler: &dyn Crawler, limit: Duration) -> Option<StatusSnapshot> {
    let mut rx = crawler.subscribe();
    let reached = timeout(limit, rx.wait_for(|s| s.runtime_state.is_terminal()))
        .await
        .ok()
        .and_then(|read| read.ok().map(|snapshot| snapshot.clone()));
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{example_site, scripted_config, StalledCrawler, SCRIPTED};
    use crate::crawler::runtime::PageCrawler;
    use std::time::Instant;
    use tokio::sync::Semaphore;

    fn manager() -> CrawlerManager {
        CrawlerManager::new(Duration::from_millis(200), Duration::from_millis(50))
    }

    fn scripted(name: &str, gate: Option<Arc<Semaphore>>) -> Arc<dyn Crawler> {
        let mut fetcher = example_site();
        if let Some(gate) = gate {
            fetcher = fetcher.gated(gate);
        }
        Arc::new(PageCrawler::new(name, SCRIPTED, scripted_config(), Arc::new(fetcher).builder()))
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let manager = manager();
        let params = CrawlParams::new("example.com", 1);

        manager.add(scripted("a", None), params.clone()).await.unwrap();
        assert_eq!(
            manager.add(scripted("a", None), params.clone()).await,
            Err(CrawlerError::AlreadyExists("a".into()))
        );
        manager.add(scripted("b", None), params).await.unwrap();
        assert_eq!(manager.list().await, vec!["a", "b"]);

        manager.remove("a").await.unwrap();
        assert!(manager.get("a").await.is_none());
        assert!(matches!(manager.remove("a").await, Err(CrawlerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_stops_live_instance() {
        let manager = manager();
        let crawler = scripted("live", Some(Arc::new(Semaphore::new(0))));
        manager.add(crawler.clone(), CrawlParams::new("example.com", 1)).await.unwrap();
        crawler.start(CrawlParams::new("example.com", 1)).await.unwrap();
        assert_eq!(manager.running().await, vec!["live"]);

        manager.remove("live").await.unwrap();

        assert_eq!(crawler.get_status().await.runtime_state, RuntimeState::Stopped);
        assert!(manager.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_gives_up_after_grace_period() {
        let manager = manager();
        let stalled = Arc::new(StalledCrawler::new("slow"));
        stalled.start(CrawlParams::new("example.com", 1)).await.unwrap();
        manager.add(stalled, CrawlParams::new("example.com", 1)).await.unwrap();

        let started = Instant::now();
        manager.remove("slow").await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_all_status_tolerates_stalled_instance() {
        let manager = manager();
        let params = CrawlParams::new("example.com", 1);
        manager.add(scripted("healthy", None), params.clone()).await.unwrap();
        manager.add(Arc::new(StalledCrawler::new("stalled")), params).await.unwrap();

        let statuses = tokio::time::timeout(Duration::from_secs(1), manager.get_all_status())
            .await
            .expect("status collection must not hang");

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["stalled"], StatusRead::TimedOut);
        match &statuses["healthy"] {
            StatusRead::Snapshot(snapshot) => assert_eq!(snapshot.runtime_state, RuntimeState::Idle),
            other => panic!("unexpected read {:?}", other),
        }
        assert!(manager.get_status("stalled").await.is_err());
    }

    #[tokio::test]
    async fn test_batch_operations_report_per_instance() {
        let manager = manager();
        let gate = Arc::new(Semaphore::new(0));
        manager
            .add(scripted("good", Some(gate.clone())), CrawlParams::new("example.com", 1))
            .await
            .unwrap();
        manager
            .add(scripted("bad", Some(gate)), CrawlParams::new("", 1))
            .await
            .unwrap();

        let started = manager.start_all().await;
        assert!(started["good"].is_ok());
        assert!(matches!(started["bad"], Err(CrawlerError::Config(_))));

        let paused = manager.pause_all().await;
        assert_eq!(paused.len(), 1);
        assert!(paused["good"].is_ok());

        let stopped = manager.stop_all().await;
        assert!(stopped.values().all(Result::is_ok));
        let good = manager.get("good").await.unwrap();
        assert!(matches!(
            good.get_status().await.runtime_state,
            RuntimeState::Stopping | RuntimeState::Stopped
        ));
    }
}
