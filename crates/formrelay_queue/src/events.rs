use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        queue: String,
        job_id: String,
    },
    Completed {
        queue: String,
        job_id: String,
        attempt: u32,
    },
    Retrying {
        queue: String,
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Exhausted {
        queue: String,
        job_id: String,
        attempts: u32,
        reason: String,
    },
    Stalled {
        queue: String,
        job_id: String,
        stalled_count: u32,
        abandoned: bool,
    },
    Error {
        queue: String,
        message: String,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::Enqueued { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Exhausted { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => Some(job_id),
            QueueEvent::Error { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "job.enqueued",
            QueueEvent::Completed { .. } => "job.completed",
            QueueEvent::Retrying { .. } => "job.retrying",
            QueueEvent::Exhausted { .. } => "job.exhausted",
            QueueEvent::Stalled { .. } => "job.stalled",
            QueueEvent::Error { .. } => "queue.error",
        }
    }
}
