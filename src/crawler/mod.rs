pub mod backend;
pub mod config;
pub mod manager;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use backend::{CrawlParams, Crawler, CrawlerStats, RuntimeState, StatusSnapshot};
pub use config::{BackendDefaults, CrawlerConfig};
pub use manager::{CrawlerManager, StatusRead};
pub use registry::{CrawlerFactory, Registry};
pub use runtime::PageCrawler;
pub use scheduler::Scheduler;
