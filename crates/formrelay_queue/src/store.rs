use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::config::{Backoff, JobOptions};
use crate::error::{QueueError, QueueResult};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const JOB_COLUMNS: &str = "seq, job_id, queue, state, payload_json, attempts_made, max_attempts, backoff_json, remove_on_complete, stalled_count, available_at, lease_token, lease_until, failure_reason, created_at, updated_at";

pub const STALLED_REASON: &str = "job stalled more than allowable limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub seq: i64,
    pub job_id: String,
    pub queue: String,
    pub state: String,
    pub payload_json: String,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub backoff_json: String,
    pub remove_on_complete: bool,
    pub stalled_count: i64,
    pub available_at: i64,
    pub lease_token: Option<String>,
    pub lease_until: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRecord {
    pub fn backoff(&self) -> QueueResult<Backoff> {
        serde_json::from_str(&self.backoff_json).map_err(QueueError::Decode)
    }

    pub fn is_in(&self, state: JobState) -> bool {
        self.state == state.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetterRecord {
    pub job_id: String,
    pub queue: String,
    pub payload_json: String,
    pub attempts_made: i64,
    pub failure_reason: String,
    pub created_at: String,
    pub failed_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct QueueCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub dead: i64,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ExpiredLease {
    pub job_id: String,
    pub lease_token: String,
    pub stalled_count: i64,
}

// Every transition is one conditional statement keyed on the lease token.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub async fn connect(url: &str, max_connections: u32) -> QueueResult<Self> {
        let uri = normalize_sqlite_uri(url);
        let options = SqliteConnectOptions::from_str(&uri)
            .map_err(|source| QueueError::InvalidUrl {
                url: uri.clone(),
                source,
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> QueueResult<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|source| QueueError::Migration {
                    statement: sql.to_string(),
                    source,
                })?;
        }
        info!("job queue sqlite schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_job(
        &self,
        queue: &str,
        payload_json: &str,
        options: &JobOptions,
    ) -> QueueResult<JobRecord> {
        let now = Utc::now();
        let job_id = Uuid::now_v7().to_string();
        let backoff_json = serde_json::to_string(&options.backoff).map_err(QueueError::Encode)?;

        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "INSERT INTO jobs(job_id, queue, state, payload_json, max_attempts, backoff_json, remove_on_complete, available_at, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {JOB_COLUMNS}"
        ))
        .bind(&job_id)
        .bind(queue)
        .bind(JobState::Waiting.as_str())
        .bind(payload_json)
        .bind(i64::from(options.attempts.max(1)))
        .bind(&backoff_json)
        .bind(options.remove_on_complete)
        .bind(now.timestamp_millis())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn claim_next(&self, queue: &str, lock_duration: Duration) -> QueueResult<Option<JobRecord>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let lease_until = now_ms.saturating_add(duration_millis(lock_duration));
        let lease_token = Uuid::now_v7().to_string();

        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE jobs SET state = ?, lease_token = ?, lease_until = ?, updated_at = ? WHERE seq = (SELECT seq FROM jobs WHERE queue = ? AND state = ? AND available_at <= ? ORDER BY available_at ASC, seq ASC LIMIT 1) AND state = ? RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobState::Active.as_str())
        .bind(&lease_token)
        .bind(lease_until)
        .bind(now.to_rfc3339())
        .bind(queue)
        .bind(JobState::Waiting.as_str())
        .bind(now_ms)
        .bind(JobState::Waiting.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn complete(&self, job_id: &str, lease_token: &str, remove: bool) -> QueueResult<bool> {
        let result = if remove {
            sqlx::query("DELETE FROM jobs WHERE job_id = ? AND lease_token = ? AND state = ?")
                .bind(job_id)
                .bind(lease_token)
                .bind(JobState::Active.as_str())
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query(
                "UPDATE jobs SET state = ?, lease_token = NULL, lease_until = NULL, updated_at = ? WHERE job_id = ? AND lease_token = ? AND state = ?",
            )
            .bind(JobState::Completed.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .bind(lease_token)
            .bind(JobState::Active.as_str())
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() > 0)
    }

    pub async fn reschedule(
        &self,
        job_id: &str,
        lease_token: &str,
        reason: &str,
        delay: Duration,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let available_at = now.timestamp_millis().saturating_add(duration_millis(delay));

        let result = sqlx::query(
            "UPDATE jobs SET state = ?, attempts_made = attempts_made + 1, available_at = ?, lease_token = NULL, lease_until = NULL, failure_reason = ?, updated_at = ? WHERE job_id = ? AND lease_token = ? AND state = ?",
        )
        .bind(JobState::Waiting.as_str())
        .bind(available_at)
        .bind(reason)
        .bind(now.to_rfc3339())
        .bind(job_id)
        .bind(lease_token)
        .bind(JobState::Active.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn dead_letter_failed(&self, job_id: &str, lease_token: &str, reason: &str) -> QueueResult<bool> {
        self.move_to_dead_letters(job_id, lease_token, 1, reason, None).await
    }

    pub(crate) async fn expired_leases(&self, queue: &str) -> QueueResult<Vec<ExpiredLease>> {
        let rows = sqlx::query_as::<_, ExpiredLease>(
            "SELECT job_id, lease_token, stalled_count FROM jobs WHERE queue = ? AND state = ? AND lease_token IS NOT NULL AND lease_until < ? ORDER BY seq ASC",
        )
        .bind(queue)
        .bind(JobState::Active.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub(crate) async fn requeue_stalled(&self, job_id: &str, lease_token: &str) -> QueueResult<bool> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, stalled_count = stalled_count + 1, lease_token = NULL, lease_until = NULL, available_at = ?, updated_at = ? WHERE job_id = ? AND lease_token = ? AND state = ? AND lease_until < ?",
        )
        .bind(JobState::Waiting.as_str())
        .bind(now_ms)
        .bind(now.to_rfc3339())
        .bind(job_id)
        .bind(lease_token)
        .bind(JobState::Active.as_str())
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn dead_letter_stalled(&self, job_id: &str, lease_token: &str) -> QueueResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        self.move_to_dead_letters(job_id, lease_token, 0, STALLED_REASON, Some(now_ms))
            .await
    }

    async fn move_to_dead_letters(
        &self,
        job_id: &str,
        lease_token: &str,
        extra_attempts: i64,
        reason: &str,
        expired_before: Option<i64>,
    ) -> QueueResult<bool> {
        let failed_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "INSERT INTO dead_letters(job_id, queue, payload_json, attempts_made, failure_reason, created_at, failed_at) SELECT job_id, queue, payload_json, attempts_made + ?, ?, created_at, ? FROM jobs WHERE job_id = ? AND lease_token = ? AND state = ? AND (? IS NULL OR lease_until < ?)",
        )
        .bind(extra_attempts)
        .bind(reason)
        .bind(&failed_at)
        .bind(job_id)
        .bind(lease_token)
        .bind(JobState::Active.as_str())
        .bind(expired_before)
        .bind(expired_before)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_dead_letter(&self, job_id: &str) -> QueueResult<Option<DeadLetterRecord>> {
        let record = sqlx::query_as::<_, DeadLetterRecord>(
            "SELECT job_id, queue, payload_json, attempts_made, failure_reason, created_at, failed_at FROM dead_letters WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_dead_letters(&self, queue: &str, limit: i64) -> QueueResult<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRecord>(
            "SELECT job_id, queue, payload_json, attempts_made, failure_reason, created_at, failed_at FROM dead_letters WHERE queue = ? ORDER BY failed_at DESC LIMIT ?",
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let now_ms = Utc::now().timestamp_millis();
        let counts = sqlx::query_as::<_, QueueCounts>(
            "SELECT \
               COALESCE(SUM(CASE WHEN state = 'waiting' AND available_at <= ? THEN 1 ELSE 0 END), 0) AS waiting, \
               COALESCE(SUM(CASE WHEN state = 'waiting' AND available_at > ? THEN 1 ELSE 0 END), 0) AS delayed, \
               COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0) AS active, \
               COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) AS completed, \
               (SELECT COUNT(*) FROM dead_letters WHERE queue = ?) AS dead \
             FROM jobs WHERE queue = ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(queue)
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
