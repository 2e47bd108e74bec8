pub mod consumer;
pub mod events;
pub mod handler;
pub mod job;

// Re-export common types
pub use consumer::EventConsumer;
pub use events::{CommandType, Delivery, EventMessage, StartPayload, StatusEvent, StatusEventType};
pub use handler::{JobView, Orchestrator, Outcome};
pub use job::{Job, JobParameters, JobStatus};
