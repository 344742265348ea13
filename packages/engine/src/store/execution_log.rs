//! Append-only execution log stream, one gapless sequence per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "log_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line produced by a running job, before a sequence number exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub job_id: Uuid,
    pub line_number: i64,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// Append a batch in producer order, assigning contiguous line numbers.
    ///
    /// A transaction-scoped advisory lock on the job id serializes concurrent
    /// appenders, so the per-job sequence stays gapless and strictly
    /// increasing. The unique `(job_id, line_number)` constraint backs this up.
    pub async fn append_batch(job_id: Uuid, batch: &[LogLine], pool: &PgPool) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('execution_logs'), hashtext($1))")
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;

        let last: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(line_number), 0) FROM execution_logs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        for (offset, line) in batch.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO execution_logs (job_id, line_number, level, message, created_at)
                VALUES ($1, $2, $3, $4, NOW())
                "#,
            )
            .bind(job_id)
            .bind(last + 1 + offset as i64)
            .bind(line.level)
            .bind(&line.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Read log lines for a job, optionally starting after a known line.
    pub async fn fetch(job_id: Uuid, after_line: Option<i64>, pool: &PgPool) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, line_number, level, message, created_at
            FROM execution_logs
            WHERE job_id = $1 AND line_number > $2
            ORDER BY line_number ASC
            "#,
        )
        .bind(job_id)
        .bind(after_line.unwrap_or(0))
        .fetch_all(pool)
        .await?;

        Ok(logs)
    }
}
