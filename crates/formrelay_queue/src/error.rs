use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue broker URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("queue broker unavailable: {0}")]
    Broker(#[from] sqlx::Error),
    #[error("schema migration failed for statement `{statement}`: {source}")]
    Migration {
        statement: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to encode job data: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode stored job data: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("queue {0} is closed")]
    Closed(String),
}

pub type QueueResult<T> = Result<T, QueueError>;
