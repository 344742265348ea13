//! Worker registry: one row per live executor, refreshed by heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Active,
    Draining,
    Stopped,
}

pub(crate) const WORKER_COLUMNS: &str = "id, name, hostname, status, max_concurrent_jobs, \
     current_job_count, last_heartbeat_at, metadata, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkerRecord {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    /// Human name, `worker-<short>@<host>`.
    pub name: String,
    pub hostname: String,
    #[builder(default)]
    pub status: WorkerStatus,
    #[builder(default = 1)]
    pub max_concurrent_jobs: i32,
    #[builder(default = 0)]
    pub current_job_count: i32,
    #[builder(default = Utc::now())]
    pub last_heartbeat_at: DateTime<Utc>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a dead-worker sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub workers_stopped: usize,
    pub jobs_requeued: usize,
    pub jobs_interrupted: usize,
}

impl WorkerRecord {
    /// Register on startup; a restart under the same name refreshes the row.
    pub async fn register(&self, pool: &PgPool) -> Result<Self> {
        let worker = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO job_workers (
                id, name, hostname, status, max_concurrent_jobs,
                current_job_count, last_heartbeat_at, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                status = EXCLUDED.status,
                max_concurrent_jobs = EXCLUDED.max_concurrent_jobs,
                current_job_count = EXCLUDED.current_job_count,
                last_heartbeat_at = NOW(),
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {WORKER_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.hostname)
        .bind(self.status)
        .bind(self.max_concurrent_jobs)
        .bind(self.current_job_count)
        .bind(self.last_heartbeat_at)
        .bind(&self.metadata)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await?;

        Ok(worker)
    }

    /// Refresh liveness. Idempotent.
    pub async fn heartbeat(name: &str, current_job_count: i32, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_workers
            SET last_heartbeat_at = NOW(),
                current_job_count = $2,
                updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(current_job_count)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn set_status(name: &str, status: WorkerStatus, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_workers
            SET status = $2, updated_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(status)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>> {
        let workers = sqlx::query_as::<_, Self>(&format!(
            "SELECT {WORKER_COLUMNS} FROM job_workers ORDER BY name"
        ))
        .fetch_all(pool)
        .await?;

        Ok(workers)
    }

    /// Stop workers whose last heartbeat predates `cutoff` and recover their
    /// running jobs: back to pending while retries remain, else interrupted.
    pub async fn reap_dead(cutoff: DateTime<Utc>, pool: &PgPool) -> Result<ReapReport> {
        let mut tx = pool.begin().await?;

        let names: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE job_workers
            SET status = 'stopped', updated_at = NOW()
            WHERE last_heartbeat_at < $1 AND status != 'stopped'
            RETURNING name
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        if names.is_empty() {
            tx.commit().await?;
            return Ok(ReapReport::default());
        }

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                worker_id = NULL,
                started_at = NULL,
                error_message = 'worker died before completion',
                error_kind = 'interrupted',
                updated_at = NOW()
            WHERE worker_id = ANY($1) AND status = 'running' AND retry_count < max_retries
            "#,
        )
        .bind(&names)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let interrupted = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'interrupted',
                error_message = 'worker died before completion',
                error_kind = 'interrupted',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE worker_id = ANY($1) AND status = 'running'
            "#,
        )
        .bind(&names)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(ReapReport {
            workers_stopped: names.len(),
            jobs_requeued: requeued as usize,
            jobs_interrupted: interrupted as usize,
        })
    }
}
