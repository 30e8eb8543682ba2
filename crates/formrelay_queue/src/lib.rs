pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod store;

pub use config::{Backoff, JobOptions, QueueConfig, QueueSettings};
pub use error::{QueueError, QueueResult};
pub use events::QueueEvent;
pub use queue::{ClaimedJob, FailureOutcome, JobHandle, JobHandler, JobQueue, StallReport};
pub use store::{DeadLetterRecord, JobRecord, JobStore, QueueCounts, STALLED_REASON};
