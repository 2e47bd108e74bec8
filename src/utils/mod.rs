pub mod logging;
pub mod metrics;
pub mod retry;

// Re-export common functions and types
pub use logging::{init_logging, default_log_file};
pub use metrics::{EventDisposition, MetricsCollector, Metrics};
pub use retry::RetryPolicy;
