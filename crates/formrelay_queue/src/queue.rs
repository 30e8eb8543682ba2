use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Backoff, JobOptions, QueueConfig, QueueSettings};
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::store::{DeadLetterRecord, JobRecord, JobStore, QueueCounts};

const EVENT_CAPACITY: usize = 256;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ClaimedJob) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub queue: String,
    pub payload: Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
    pub stalled_count: u32,
    pub created_at: String,
    lease_token: String,
}

impl ClaimedJob {
    pub fn attempt(&self) -> u32 {
        self.attempts_made.saturating_add(1)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    fn from_record(record: JobRecord) -> QueueResult<Self> {
        let backoff = record.backoff()?;
        let payload = serde_json::from_str(&record.payload_json).map_err(QueueError::Decode)?;
        Ok(Self {
            id: record.job_id,
            queue: record.queue,
            payload,
            attempts_made: to_u32(record.attempts_made),
            max_attempts: to_u32(record.max_attempts),
            backoff,
            remove_on_complete: record.remove_on_complete,
            stalled_count: to_u32(record.stalled_count),
            created_at: record.created_at,
            lease_token: record.lease_token.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    LeaseLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: usize,
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    store: JobStore,
    settings: QueueSettings,
    defaults: JobOptions,
    events: broadcast::Sender<QueueEvent>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl JobQueue {
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let store = JobStore::connect(&config.url, config.max_connections).await?;
        info!(queue = %config.name, "job queue connected");
        Ok(Self::with_store(
            store,
            config.name.clone(),
            config.settings.clone(),
            config.defaults.clone(),
        ))
    }

    pub fn with_store(
        store: JobStore,
        name: String,
        settings: QueueSettings,
        defaults: JobOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name,
                store,
                settings,
                defaults,
                events,
                wake: Notify::new(),
                shutdown,
                workers: Mutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub async fn enqueue<T: Serialize>(&self, payload: &T) -> QueueResult<JobHandle> {
        let options = self.inner.defaults.clone();
        self.enqueue_with(payload, &options).await
    }

    pub async fn enqueue_with<T: Serialize>(
        &self,
        payload: &T,
        options: &JobOptions,
    ) -> QueueResult<JobHandle> {
        self.ensure_open()?;
        let payload_json = serde_json::to_string(payload).map_err(QueueError::Encode)?;
        let record = self
            .inner
            .store
            .insert_job(&self.inner.name, &payload_json, options)
            .await?;

        debug!(queue = %self.inner.name, job_id = %record.job_id, "job enqueued");
        self.emit(QueueEvent::Enqueued {
            queue: self.inner.name.clone(),
            job_id: record.job_id.clone(),
        });
        self.inner.wake.notify_one();

        Ok(JobHandle {
            id: record.job_id,
            queue: record.queue,
            created_at: record.created_at,
        })
    }

    pub async fn claim(&self) -> QueueResult<Option<ClaimedJob>> {
        self.ensure_open()?;
        let record = self
            .inner
            .store
            .claim_next(&self.inner.name, self.inner.settings.lock_duration)
            .await?;
        record.map(ClaimedJob::from_record).transpose()
    }

    pub async fn complete(&self, job: &ClaimedJob) -> QueueResult<bool> {
        let done = self
            .inner
            .store
            .complete(&job.id, &job.lease_token, job.remove_on_complete)
            .await?;

        if done {
            self.emit(QueueEvent::Completed {
                queue: self.inner.name.clone(),
                job_id: job.id.clone(),
                attempt: job.attempt(),
            });
        } else {
            warn!(queue = %self.inner.name, job_id = %job.id, "completion ignored: lease no longer held");
        }
        Ok(done)
    }

    pub async fn fail(&self, job: &ClaimedJob, reason: &str) -> QueueResult<FailureOutcome> {
        let attempt = job.attempt();

        if attempt < job.max_attempts {
            let delay = job.backoff.delay_after(attempt);
            let rescheduled = self
                .inner
                .store
                .reschedule(&job.id, &job.lease_token, reason, delay)
                .await?;
            if !rescheduled {
                warn!(queue = %self.inner.name, job_id = %job.id, "failure ignored: lease no longer held");
                return Ok(FailureOutcome::LeaseLost);
            }

            self.emit(QueueEvent::Retrying {
                queue: self.inner.name.clone(),
                job_id: job.id.clone(),
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason: reason.to_string(),
            });
            return Ok(FailureOutcome::Retrying { attempt, delay });
        }

        let moved = self
            .inner
            .store
            .dead_letter_failed(&job.id, &job.lease_token, reason)
            .await?;
        if !moved {
            warn!(queue = %self.inner.name, job_id = %job.id, "failure ignored: lease no longer held");
            return Ok(FailureOutcome::LeaseLost);
        }

        self.emit(QueueEvent::Exhausted {
            queue: self.inner.name.clone(),
            job_id: job.id.clone(),
            attempts: attempt,
            reason: reason.to_string(),
        });
        Ok(FailureOutcome::Exhausted { attempts: attempt })
    }

    pub async fn recover_stalled(&self) -> QueueResult<StallReport> {
        let mut report = StallReport::default();
        let max_stalled = i64::from(self.inner.settings.max_stalled_count);

        for lease in self.inner.store.expired_leases(&self.inner.name).await? {
            let stalled_count = lease.stalled_count + 1;
            let abandoned = stalled_count > max_stalled;

            let changed = if abandoned {
                self.inner
                    .store
                    .dead_letter_stalled(&lease.job_id, &lease.lease_token)
                    .await?
            } else {
                self.inner
                    .store
                    .requeue_stalled(&lease.job_id, &lease.lease_token)
                    .await?
            };
            if !changed {
                continue;
            }

            if abandoned {
                report.abandoned += 1;
            } else {
                report.requeued += 1;
                self.inner.wake.notify_one();
            }
            self.emit(QueueEvent::Stalled {
                queue: self.inner.name.clone(),
                job_id: lease.job_id,
                stalled_count: to_u32(stalled_count),
                abandoned,
            });
        }

        Ok(report)
    }

    pub async fn process(&self, handler: Arc<dyn JobHandler>, concurrency: usize) -> QueueResult<()> {
        self.ensure_open()?;
        let mut workers = self.inner.workers.lock().await;

        for worker in 0..concurrency.max(1) {
            let queue = self.clone();
            let handler = Arc::clone(&handler);
            let shutdown = self.inner.shutdown.subscribe();
            workers.spawn(async move { queue.consume(worker, handler, shutdown).await });
        }

        let queue = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        workers.spawn(async move { queue.check_stalled(shutdown).await });

        info!(queue = %self.inner.name, concurrency = concurrency.max(1), "queue consumers started");
        Ok(())
    }

    pub async fn close(&self, timeout: Duration) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!(queue = %self.inner.name, "closing job queue");
        self.inner.shutdown.send_replace(true);

        let mut workers = self.inner.workers.lock().await;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    error!(queue = %self.inner.name, error = %err, "queue consumer ended abnormally");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                queue = %self.inner.name,
                timeout_ms = timeout.as_millis() as u64,
                "in-flight jobs did not finish in time; their leases will expire"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        self.inner.store.close().await;
        info!(queue = %self.inner.name, drained, "job queue closed");
        drained
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.inner.store.ping().await
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<JobRecord>> {
        self.inner.store.get_job(job_id).await
    }

    pub async fn get_dead_letter(&self, job_id: &str) -> QueueResult<Option<DeadLetterRecord>> {
        self.inner.store.get_dead_letter(job_id).await
    }

    pub async fn list_dead_letters(&self, limit: i64) -> QueueResult<Vec<DeadLetterRecord>> {
        self.inner.store.list_dead_letters(&self.inner.name, limit).await
    }

    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        self.inner.store.counts(&self.inner.name).await
    }

    async fn consume(
        &self,
        worker: usize,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(queue = %self.inner.name, worker, "consumer loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.claim().await {
                Ok(Some(job)) => self.run(worker, Arc::clone(&handler), job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = self.inner.wake.notified() => {}
                        _ = tokio::time::sleep(self.inner.settings.poll_interval) => {}
                    }
                }
                Err(QueueError::Closed(_)) => break,
                Err(err) => {
                    self.report_error("claim failed", &err);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.inner.settings.poll_interval) => {}
                    }
                }
            }
        }
        debug!(queue = %self.inner.name, worker, "consumer loop stopped");
    }

    async fn run(&self, worker: usize, handler: Arc<dyn JobHandler>, job: ClaimedJob) {
        debug!(queue = %self.inner.name, worker, job_id = %job.id, attempt = job.attempt(), "job claimed");
        let handler_timeout = self.inner.settings.handler_timeout();

        let task_job = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(&task_job).await });
        let _abort_guard = AbortOnDrop(task.abort_handle());

        let outcome = match tokio::time::timeout(handler_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(format!("{err:#}")),
            Ok(Err(join_err)) => Err(format!("handler aborted: {join_err}")),
            Err(_) => {
                task.abort();
                Err(format!("handler timed out after {} ms", handler_timeout.as_millis()))
            }
        };

        let acknowledged = match outcome {
            Ok(()) => self.complete(&job).await.map(|_| ()),
            Err(reason) => self.fail(&job, &reason).await.map(|_| ()),
        };
        if let Err(err) = acknowledged {
            self.report_error("failed to record job outcome", &err);
        }
    }

    async fn check_stalled(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.settings.stalled_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    match self.recover_stalled().await {
                        Ok(report) if report.requeued + report.abandoned > 0 => {
                            warn!(
                                queue = %self.inner.name,
                                requeued = report.requeued,
                                abandoned = report.abandoned,
                                "stalled jobs recovered"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => self.report_error("stall check failed", &err),
                    }
                }
            }
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    fn report_error(&self, context: &str, err: &QueueError) {
        error!(queue = %self.inner.name, error = %err, "{context}");
        self.emit(QueueEvent::Error {
            queue: self.inner.name.clone(),
            message: format!("{context}: {err}"),
        });
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }
}

// Aborts a spawned handler when the consumer running it is cancelled.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
