pub mod app;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod limiter;
pub mod worker;

pub use app::{build_router, AppState, SubmissionBody};
pub use error::ApiError;
pub use events::{log_event, spawn_event_logger};
pub use lifecycle::{
    serve_until_shutdown, BootConfig, ConfigError, Shutdown, ShutdownOutcome, ShutdownReason,
    DEFAULT_PORT,
};
pub use limiter::{Admission, AdmissionLimiter, LimiterConfig, RateLimitExceeded};
pub use worker::SubmissionWorker;
