use std::collections::{HashSet, VecDeque};
use regex::Regex;
use url::Url;
use tracing::{debug, warn};

use crate::crawler::task::CrawlTask;

/// Breadth-first frontier for one crawl.
///
/// Only links on the seed's domain (or its subdomains) are followed, each normalized URL is
/// scheduled at most once, and nothing deeper than `max_depth` is queued.
pub struct Scheduler {
    /// Tasks waiting to be fetched, in discovery order
    queue: VecDeque<CrawlTask>,

    /// Normalized URLs already scheduled
    seen_urls: HashSet<String>,

    /// Maximum link distance from the seed
    max_depth: u32,

    /// Registrable host of the seed, without a leading `www.`
    allowed_host: String,

    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,
}

impl Scheduler {
    /// Create a frontier seeded with `seed`
    pub fn new(seed: &Url, max_depth: u32, include: &[String], exclude: &[String]) -> Self {
        let allowed_host = seed
            .host_str()
            .map(|host| host.trim_start_matches("www.").to_lowercase())
            .unwrap_or_default();

        let mut scheduler = Self {
            queue: VecDeque::new(),
            seen_urls: HashSet::new(),
            max_depth,
            allowed_host,
            include_patterns: compile_patterns(include, "include"),
            exclude_patterns: compile_patterns(exclude, "exclude"),
        };

        // The seed bypasses the pattern filters
        let seed_url = normalize_url(seed.as_str()).unwrap_or_else(|| seed.to_string());
        scheduler.seen_urls.insert(seed_url.clone());
        scheduler.queue.push_back(CrawlTask::seed(seed_url));

        scheduler
    }

    /// Queue the links discovered on `parent`, returning how many were accepted
    pub fn enqueue_links(&mut self, parent: &CrawlTask, links: &[String]) -> usize {
        if parent.depth >= self.max_depth {
            return 0;
        }

        let mut accepted = 0;
        for link in links {
            if let Some(url) = self.admit(link) {
                self.queue.push_back(parent.child(url));
                accepted += 1;
            }
        }

        accepted
    }

    /// Take up to `size` tasks off the front of the queue
    pub fn next_batch(&mut self, size: usize) -> Vec<CrawlTask> {
        let take = size.max(1).min(self.queue.len());
        self.queue.drain(..take).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get the current count of scheduled URLs
    pub fn seen_count(&self) -> usize {
        self.seen_urls.len()
    }

    /// Decide whether a discovered link should be scheduled, returning its normalized form
    fn admit(&mut self, link: &str) -> Option<String> {
        let normalized = match normalize_url(link) {
            Some(url) => url,
            None => {
                debug!("Skipping invalid URL: {}", link);
                return None;
            }
        };

        if self.seen_urls.contains(&normalized) {
            return None;
        }

        let parsed = Url::parse(&normalized).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }

        let host = parsed.host_str()?.to_lowercase();
        let on_domain = host == self.allowed_host
            || host.ends_with(&format!(".{}", self.allowed_host));
        if !on_domain {
            debug!("Skipping off-domain URL: {}", normalized);
            return None;
        }

        if self.exclude_patterns.iter().any(|p| p.is_match(&normalized)) {
            debug!("Skipping URL matching exclusion pattern: {}", normalized);
            return None;
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(&normalized))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized);
            return None;
        }

        self.seen_urls.insert(normalized.clone());
        Some(normalized)
    }
}

/// Normalize a URL so trivially different spellings dedupe to one entry
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;

    url.set_fragment(None);

    match url.query().map(str::is_empty) {
        Some(true) => url.set_query(None),
        Some(false) => {
            let mut pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        None => {}
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

fn compile_patterns(patterns: &[String], label: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", label, pattern, e);
                None
            }
        })
        .collect()
}
