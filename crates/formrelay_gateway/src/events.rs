use formrelay_queue::{JobQueue, QueueEvent};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info, warn};

pub fn spawn_event_logger(queue: &JobQueue) -> JoinHandle<()> {
    let mut events = BroadcastStream::new(queue.subscribe());
    tokio::spawn(async move {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => log_event(&event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "queue event logger fell behind");
                }
            }
        }
    })
}

pub fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::Enqueued { queue, job_id } => {
            debug!(queue = %queue, job_id = %job_id, "job waiting");
        }
        QueueEvent::Completed {
            queue,
            job_id,
            attempt,
        } => {
            info!(queue = %queue, job_id = %job_id, attempt, "job completed");
        }
        QueueEvent::Retrying {
            queue,
            job_id,
            attempt,
            delay_ms,
            reason,
        } => {
            warn!(
                queue = %queue,
                job_id = %job_id,
                attempt,
                delay_ms,
                reason = %reason,
                "job failed, retry scheduled"
            );
        }
        QueueEvent::Exhausted {
            queue,
            job_id,
            attempts,
            reason,
        } => {
            error!(
                queue = %queue,
                job_id = %job_id,
                attempts,
                reason = %reason,
                "job failed permanently and was dead-lettered; operator attention required"
            );
        }
        QueueEvent::Stalled {
            queue,
            job_id,
            stalled_count,
            abandoned,
        } => {
            if *abandoned {
                error!(
                    queue = %queue,
                    job_id = %job_id,
                    stalled_count,
                    "job stalled too often and was dead-lettered; operator attention required"
                );
            } else {
                warn!(queue = %queue, job_id = %job_id, stalled_count, "stalled job returned to the queue");
            }
        }
        QueueEvent::Error { queue, message } => {
            error!(queue = %queue, message = %message, "queue error");
        }
    }
}
