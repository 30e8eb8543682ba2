use async_trait::async_trait;
use formrelay_contract::AppendRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub updated_range: Option<String>,
    pub updated_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("spreadsheet authentication failed: {0}")]
    Auth(String),
    #[error("spreadsheet API unreachable: {0}")]
    Transport(String),
    #[error("spreadsheet API quota exceeded: {0}")]
    Quota(String),
    #[error("spreadsheet API rejected append with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl WriteError {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteError::Auth(_) => "auth",
            WriteError::Transport(_) => "transport",
            WriteError::Quota(_) => "quota",
            WriteError::Rejected { .. } => "rejected",
        }
    }
}

// Append-only: a retried call may duplicate a row but never rewrites one.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    async fn append(&self, record: &AppendRecord) -> Result<AppendReceipt, WriteError>;
}
