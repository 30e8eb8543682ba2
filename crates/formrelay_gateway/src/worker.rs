use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use formrelay_contract::JobPayload;
use formrelay_queue::{ClaimedJob, JobHandler};
use formrelay_sheets::SheetWriter;
use tracing::{error, info};

pub struct SubmissionWorker {
    writer: Arc<dyn SheetWriter>,
    product_tag: String,
}

impl SubmissionWorker {
    pub fn new(writer: Arc<dyn SheetWriter>, product_tag: impl Into<String>) -> Self {
        Self {
            writer,
            product_tag: product_tag.into(),
        }
    }
}

#[async_trait]
impl JobHandler for SubmissionWorker {
    async fn handle(&self, job: &ClaimedJob) -> anyhow::Result<()> {
        let payload: JobPayload = job
            .decode()
            .with_context(|| format!("job {} carries an unreadable payload", job.id))?;
        let name = payload.name.clone();
        let record = payload.into_record(&self.product_tag);

        match self.writer.append(&record).await {
            Ok(receipt) => {
                info!(
                    job_id = %job.id,
                    name = %name,
                    attempt = job.attempt(),
                    updated_range = receipt.updated_range.as_deref().unwrap_or("-"),
                    "submission written to sheet"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    name = %name,
                    attempt = job.attempt(),
                    max_attempts = job.max_attempts,
                    kind = err.kind(),
                    error = %err,
                    "sheet append failed"
                );
                Err(err.into())
            }
        }
    }
}
