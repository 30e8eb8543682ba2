use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_STALLED_COUNT: u32 = 1;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub url: String,
    pub name: String,
    pub max_connections: u32,
    pub settings: QueueSettings,
    pub defaults: JobOptions,
}

impl QueueConfig {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            max_connections: 5,
            settings: QueueSettings::default(),
            defaults: JobOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub poll_interval: Duration,
}

impl QueueSettings {
    // Kept one poll interval under the lease so a timed-out job is failed
    // before the stall sweep can see it.
    pub fn handler_timeout(&self) -> Duration {
        self.lock_duration
            .checked_sub(self.poll_interval)
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.lock_duration / 2)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::Exponential {
                delay_ms: DEFAULT_BACKOFF_MS,
            },
            remove_on_complete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}
