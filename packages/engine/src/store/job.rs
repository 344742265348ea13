//! Job model: one execution attempt of a registered function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Interrupted
        )
    }
}

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Retries remained; the job is pending again with `retry_count + 1`.
    Requeued,
    /// The job landed in a terminal state.
    Terminal,
    /// The job was not running (already terminal or unknown); nothing changed.
    Noop,
}

pub(crate) const JOB_COLUMNS: &str = "id, namespace, job_name, job_function_id, status, priority, \
     payload, payload_hash, result, progress, retry_count, max_retries, \
     max_duration_seconds, progress_timeout_seconds, error_message, error_kind, \
     worker_id, created_by, user_role, user_email, \
     scheduled_at, started_at, completed_at, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Identity
    pub namespace: String,
    pub job_name: String,
    #[builder(default, setter(strip_option))]
    pub job_function_id: Option<Uuid>,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub priority: i32,

    // Payload and outputs
    #[builder(default, setter(strip_option))]
    pub payload: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub payload_hash: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub progress: Option<serde_json::Value>,

    // Retry and budget overrides
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 0)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub max_duration_seconds: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub progress_timeout_seconds: Option<i64>,

    // Failure tracking
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,

    // Execution ownership
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // Submitter identity
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub user_role: Option<String>,
    #[builder(default, setter(strip_option))]
    pub user_email: Option<String>,

    // Timestamps
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Clone a terminal job into a fresh pending attempt.
    ///
    /// Used by the retry command: same function, payload, and submitter, new
    /// id and a zeroed retry budget.
    pub fn retry_clone(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: self.namespace.clone(),
            job_name: self.job_name.clone(),
            job_function_id: self.job_function_id,
            status: JobStatus::Pending,
            priority: self.priority,
            payload: self.payload.clone(),
            payload_hash: self.payload_hash.clone(),
            result: None,
            progress: None,
            retry_count: 0,
            max_retries: self.max_retries,
            max_duration_seconds: self.max_duration_seconds,
            progress_timeout_seconds: self.progress_timeout_seconds,
            error_message: None,
            error_kind: None,
            worker_id: None,
            created_by: self.created_by.clone(),
            user_role: self.user_role.clone(),
            user_email: self.user_email.clone(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub async fn insert<'e, E>(&self, executor: E) -> Result<Self>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO jobs (
                id, namespace, job_name, job_function_id, status, priority,
                payload, payload_hash, result, progress, retry_count, max_retries,
                max_duration_seconds, progress_timeout_seconds, error_message, error_kind,
                worker_id, created_by, user_role, user_email,
                scheduled_at, started_at, completed_at, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, $20,
                $21, $22, $23, $24, $25
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.namespace)
        .bind(&self.job_name)
        .bind(self.job_function_id)
        .bind(self.status)
        .bind(self.priority)
        .bind(&self.payload)
        .bind(&self.payload_hash)
        .bind(&self.result)
        .bind(&self.progress)
        .bind(self.retry_count)
        .bind(self.max_retries)
        .bind(self.max_duration_seconds)
        .bind(self.progress_timeout_seconds)
        .bind(&self.error_message)
        .bind(self.error_kind)
        .bind(&self.worker_id)
        .bind(&self.created_by)
        .bind(&self.user_role)
        .bind(&self.user_email)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(job)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    /// Claim the next eligible job for `worker_id`.
    ///
    /// Eligible means pending, due, and backed by an enabled function of the
    /// same namespace and name. `FOR UPDATE SKIP LOCKED` lets concurrent
    /// claimants pass over rows another transaction is taking, so exactly one
    /// worker wins each row.
    pub async fn claim_next(
        worker_id: &str,
        namespace: Option<&str>,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            WITH next_job AS (
                SELECT j.id
                FROM jobs j
                WHERE j.status = 'pending'
                  AND (j.scheduled_at IS NULL OR j.scheduled_at <= NOW())
                  AND ($2::text IS NULL OR j.namespace = $2)
                  AND EXISTS (
                      SELECT 1 FROM job_functions f
                      WHERE f.namespace = j.namespace
                        AND f.name = j.job_name
                        AND f.enabled
                  )
                ORDER BY j.priority DESC, COALESCE(j.scheduled_at, j.created_at) ASC, j.created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(namespace)
        .fetch_optional(pool)
        .await?;

        Ok(job)
    }

    /// Terminal success. Write-once: only a running job transitions.
    pub async fn complete(id: Uuid, result: serde_json::Value, pool: &PgPool) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    /// Record a failure, re-enqueueing while the retry budget allows.
    pub async fn fail(
        id: Uuid,
        message: &str,
        kind: ErrorKind,
        retryable: bool,
        pool: &PgPool,
    ) -> Result<FailDisposition> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r#"
            UPDATE jobs
            SET status = CASE WHEN $2 AND retry_count < max_retries
                              THEN 'pending'::job_status ELSE 'failed'::job_status END,
                retry_count = CASE WHEN $2 AND retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                worker_id = CASE WHEN $2 AND retry_count < max_retries
                                 THEN NULL ELSE worker_id END,
                started_at = CASE WHEN $2 AND retry_count < max_retries
                                  THEN NULL ELSE started_at END,
                completed_at = CASE WHEN $2 AND retry_count < max_retries
                                    THEN NULL ELSE NOW() END,
                error_message = $3,
                error_kind = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(retryable)
        .bind(message)
        .bind(kind)
        .fetch_optional(pool)
        .await?;

        Ok(match status {
            Some(JobStatus::Pending) => FailDisposition::Requeued,
            Some(_) => FailDisposition::Terminal,
            None => FailDisposition::Noop,
        })
    }

    /// Operator cancellation. Applies to pending and running jobs.
    pub async fn cancel(id: Uuid, message: Option<&str>, pool: &PgPool) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_kind = 'cancelled',
                error_message = COALESCE($2, error_message),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    /// Shutdown or dead-worker interruption.
    ///
    /// Re-enqueues while retries remain, otherwise lands terminal
    /// `interrupted`, the same rule the reaper applies.
    pub async fn interrupt(id: Uuid, message: &str, pool: &PgPool) -> Result<FailDisposition> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r#"
            UPDATE jobs
            SET status = CASE WHEN retry_count < max_retries
                              THEN 'pending'::job_status ELSE 'interrupted'::job_status END,
                retry_count = CASE WHEN retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                worker_id = CASE WHEN retry_count < max_retries
                                 THEN NULL ELSE worker_id END,
                started_at = CASE WHEN retry_count < max_retries
                                  THEN NULL ELSE started_at END,
                completed_at = CASE WHEN retry_count < max_retries
                                    THEN NULL ELSE NOW() END,
                error_message = $2,
                error_kind = 'interrupted',
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(message)
        .fetch_optional(pool)
        .await?;

        Ok(match status {
            Some(JobStatus::Pending) => FailDisposition::Requeued,
            Some(_) => FailDisposition::Terminal,
            None => FailDisposition::Noop,
        })
    }

    /// Latest progress snapshot, visible while the job runs.
    pub async fn update_progress(
        id: Uuid,
        snapshot: serde_json::Value,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(snapshot)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Outstanding duplicate for the dedup guard, if any.
    pub async fn find_outstanding_duplicate(
        namespace: &str,
        job_name: &str,
        payload_hash: &str,
        pool: &PgPool,
    ) -> Result<Option<Uuid>> {
        let existing = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM jobs
            WHERE namespace = $1 AND job_name = $2 AND payload_hash = $3
              AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(namespace)
        .bind(job_name)
        .bind(payload_hash)
        .fetch_optional(pool)
        .await?;

        Ok(existing)
    }

    /// Whether any running job still references the named function.
    pub async fn any_running_for_function(
        namespace: &str,
        job_name: &str,
        pool: &PgPool,
    ) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE namespace = $1 AND job_name = $2 AND status = 'running'
            "#,
        )
        .bind(namespace)
        .bind(job_name)
        .fetch_one(pool)
        .await?;

        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .namespace("default")
            .job_name("send-email")
            .build()
    }

    #[test]
    fn new_job_starts_pending_with_zero_retries() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.priority, 0);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Interrupted.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn retry_clone_resets_execution_state() {
        let mut job = sample_job();
        job.status = JobStatus::Failed;
        job.retry_count = 3;
        job.error_message = Some("boom".into());
        job.worker_id = Some("worker-1@host".into());
        job.payload = Some(serde_json::json!({"to": "a@b"}));

        let clone = job.retry_clone();
        assert_ne!(clone.id, job.id);
        assert_eq!(clone.status, JobStatus::Pending);
        assert_eq!(clone.retry_count, 0);
        assert_eq!(clone.payload, job.payload);
        assert!(clone.error_message.is_none());
        assert!(clone.worker_id.is_none());
        assert!(clone.completed_at.is_none());
    }
}
