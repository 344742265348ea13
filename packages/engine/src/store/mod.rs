//! Durable state for the job engine.
//!
//! The [`JobStore`] trait is the storage contract the rest of the engine
//! programs against: queue dispatch primitives, the function registry, worker
//! liveness, and the execution log stream. [`PostgresJobStore`] is the
//! production implementation; `testing::InMemoryJobStore` implements the same
//! contract for tests and single-process embedding.

mod execution_log;
mod function;
mod job;
mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};

pub use execution_log::{ExecutionLog, LogLevel, LogLine};
pub use function::{FunctionSource, JobFunction};
pub use job::{FailDisposition, Job, JobStatus};
pub use worker::{ReapReport, WorkerRecord, WorkerStatus};

/// Filters for job listings.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct JobFilter {
    #[builder(default, setter(into, strip_option))]
    pub namespace: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub job_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub status: Option<JobStatus>,
    #[builder(default, setter(into, strip_option))]
    pub created_by: Option<String>,
    #[builder(default = 50)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

impl JobFilter {
    fn limit(&self) -> i64 {
        if self.limit <= 0 { 50 } else { self.limit }
    }
}

/// Per-status counts for the stats projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub interrupted: i64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
            JobStatus::Interrupted => self.interrupted += count,
        }
    }
}

/// Storage contract for the engine.
///
/// Every method is a single atomic unit of work; dispatch primitives are safe
/// under concurrent callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Queue
    async fn insert_job(&self, job: Job) -> Result<Job>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    /// Claim the highest-priority eligible pending job; exactly one caller
    /// wins each row under concurrency.
    async fn claim_next(&self, worker_name: &str, namespace: Option<&str>) -> Result<Option<Job>>;
    async fn complete_job(&self, id: Uuid, result: serde_json::Value) -> Result<bool>;
    async fn fail_job(
        &self,
        id: Uuid,
        message: &str,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailDisposition>;
    async fn cancel_job(&self, id: Uuid, message: Option<&str>) -> Result<bool>;
    async fn interrupt_job(&self, id: Uuid, message: &str) -> Result<FailDisposition>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    async fn job_stats(&self, namespace: Option<&str>) -> Result<JobStats>;
    /// Outstanding `{pending, running}` job with the same payload hash, if any.
    async fn find_outstanding_duplicate(
        &self,
        namespace: &str,
        job_name: &str,
        payload_hash: &str,
    ) -> Result<Option<Uuid>>;

    // Observability
    async fn append_progress(&self, id: Uuid, snapshot: serde_json::Value) -> Result<()>;
    async fn append_logs(&self, id: Uuid, batch: &[LogLine]) -> Result<()>;
    async fn get_logs(&self, id: Uuid, after_line: Option<i64>) -> Result<Vec<ExecutionLog>>;

    // Function registry
    async fn upsert_function(&self, func: JobFunction) -> Result<JobFunction>;
    async fn get_function(&self, id: Uuid) -> Result<Option<JobFunction>>;
    async fn get_function_by_name(&self, namespace: &str, name: &str)
        -> Result<Option<JobFunction>>;
    async fn list_functions(&self, namespace: Option<&str>) -> Result<Vec<JobFunction>>;
    async fn set_function_enabled(&self, namespace: &str, name: &str, enabled: bool)
        -> Result<bool>;
    /// Delete a function. Refused while running jobs reference it by name, so
    /// version rollover never strands an execution.
    async fn delete_function(&self, namespace: &str, name: &str) -> Result<()>;

    // Worker registry
    async fn register_worker(&self, worker: WorkerRecord) -> Result<WorkerRecord>;
    async fn worker_heartbeat(&self, name: &str, current_job_count: i32) -> Result<()>;
    async fn set_worker_status(&self, name: &str, status: WorkerStatus) -> Result<()>;
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;
    async fn reap_dead_workers(&self, cutoff: DateTime<Utc>) -> Result<ReapReport>;

    // Scheduler gate
    /// Insert a cron-fired job exactly once across the fleet.
    ///
    /// `fire_key` identifies `(namespace, name, minute)`; losing the
    /// cross-instance gate returns `Ok(None)`.
    async fn fire_scheduled(
        &self,
        fire_key: &str,
        minute_start: DateTime<Utc>,
        job: Job,
    ) -> Result<Option<Job>>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the engine's schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: Job) -> Result<Job> {
        job.insert(&self.pool).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Job::find_by_id(id, &self.pool).await
    }

    async fn claim_next(&self, worker_name: &str, namespace: Option<&str>) -> Result<Option<Job>> {
        Job::claim_next(worker_name, namespace, &self.pool).await
    }

    async fn complete_job(&self, id: Uuid, result: serde_json::Value) -> Result<bool> {
        Job::complete(id, result, &self.pool).await
    }

    async fn fail_job(
        &self,
        id: Uuid,
        message: &str,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailDisposition> {
        Job::fail(id, message, kind, retryable, &self.pool).await
    }

    async fn cancel_job(&self, id: Uuid, message: Option<&str>) -> Result<bool> {
        Job::cancel(id, message, &self.pool).await
    }

    async fn interrupt_job(&self, id: Uuid, message: &str) -> Result<FailDisposition> {
        Job::interrupt(id, message, &self.pool).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE ($1::text IS NULL OR namespace = $1)
              AND ($2::text IS NULL OR job_name = $2)
              AND ($3::job_status IS NULL OR status = $3)
              AND ($4::text IS NULL OR created_by = $4)
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#,
            job::JOB_COLUMNS
        ))
        .bind(&filter.namespace)
        .bind(&filter.job_name)
        .bind(filter.status)
        .bind(&filter.created_by)
        .bind(filter.limit())
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn job_stats(&self, namespace: Option<&str>) -> Result<JobStats> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM jobs
            WHERE ($1::text IS NULL OR namespace = $1)
            GROUP BY status
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            stats.record(status, count);
        }
        Ok(stats)
    }

    async fn find_outstanding_duplicate(
        &self,
        namespace: &str,
        job_name: &str,
        payload_hash: &str,
    ) -> Result<Option<Uuid>> {
        Job::find_outstanding_duplicate(namespace, job_name, payload_hash, &self.pool).await
    }

    async fn append_progress(&self, id: Uuid, snapshot: serde_json::Value) -> Result<()> {
        Job::update_progress(id, snapshot, &self.pool).await
    }

    async fn append_logs(&self, id: Uuid, batch: &[LogLine]) -> Result<()> {
        ExecutionLog::append_batch(id, batch, &self.pool).await
    }

    async fn get_logs(&self, id: Uuid, after_line: Option<i64>) -> Result<Vec<ExecutionLog>> {
        ExecutionLog::fetch(id, after_line, &self.pool).await
    }

    async fn upsert_function(&self, func: JobFunction) -> Result<JobFunction> {
        func.upsert(&self.pool).await
    }

    async fn get_function(&self, id: Uuid) -> Result<Option<JobFunction>> {
        JobFunction::find_by_id(id, &self.pool).await
    }

    async fn get_function_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<JobFunction>> {
        JobFunction::find_by_name(namespace, name, &self.pool).await
    }

    async fn list_functions(&self, namespace: Option<&str>) -> Result<Vec<JobFunction>> {
        JobFunction::list(namespace, &self.pool).await
    }

    async fn set_function_enabled(
        &self,
        namespace: &str,
        name: &str,
        enabled: bool,
    ) -> Result<bool> {
        JobFunction::set_enabled(namespace, name, enabled, &self.pool).await
    }

    async fn delete_function(&self, namespace: &str, name: &str) -> Result<()> {
        if Job::any_running_for_function(namespace, name, &self.pool).await? {
            return Err(EngineError::Validation(format!(
                "cannot delete {namespace}/{name}: running jobs still reference it"
            )));
        }
        if !JobFunction::delete(namespace, name, &self.pool).await? {
            return Err(EngineError::NotFound(format!("function {namespace}/{name}")));
        }
        Ok(())
    }

    async fn register_worker(&self, worker: WorkerRecord) -> Result<WorkerRecord> {
        worker.register(&self.pool).await
    }

    async fn worker_heartbeat(&self, name: &str, current_job_count: i32) -> Result<()> {
        WorkerRecord::heartbeat(name, current_job_count, &self.pool).await
    }

    async fn set_worker_status(&self, name: &str, status: WorkerStatus) -> Result<()> {
        WorkerRecord::set_status(name, status, &self.pool).await
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        WorkerRecord::list(&self.pool).await
    }

    async fn reap_dead_workers(&self, cutoff: DateTime<Utc>) -> Result<ReapReport> {
        WorkerRecord::reap_dead(cutoff, &self.pool).await
    }

    async fn fire_scheduled(
        &self,
        fire_key: &str,
        minute_start: DateTime<Utc>,
        job: Job,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        // Transaction-scoped advisory lock: the losing instance sees `false`
        // while the winner's insert is in flight.
        let won: bool = sqlx::query_scalar(
            "SELECT pg_try_advisory_xact_lock(hashtext('cron_fire'), hashtext($1))",
        )
        .bind(fire_key)
        .fetch_one(&mut *tx)
        .await?;

        if !won {
            return Ok(None);
        }

        // A winner that already committed for this minute also counts as
        // "another instance handled it".
        let already_fired: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE namespace = $1 AND job_name = $2 AND created_by = $3
                  AND scheduled_at >= $4
                  AND scheduled_at < $4 + INTERVAL '1 minute'
            )
            "#,
        )
        .bind(&job.namespace)
        .bind(&job.job_name)
        .bind(&job.created_by)
        .bind(minute_start)
        .fetch_one(&mut *tx)
        .await?;

        if already_fired {
            tx.commit().await?;
            return Ok(None);
        }

        let inserted = job.insert(&mut *tx).await?;

        tx.commit().await?;

        Ok(Some(inserted))
    }
}
