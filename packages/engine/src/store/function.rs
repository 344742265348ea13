//! JobFunction model: registered code plus execution metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "function_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FunctionSource {
    #[default]
    Filesystem,
    Api,
}

pub(crate) const FUNCTION_COLUMNS: &str = "id, namespace, name, code, is_bundled, enabled, \
     schedule, schedule_params, timeout_seconds, progress_timeout_seconds, \
     memory_limit_mb, max_retries, allow_net, allow_env, allow_read, allow_write, \
     require_roles, disable_execution_logs, version, source, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobFunction {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Identity: (namespace, name) unique
    pub namespace: String,
    pub name: String,

    // Bundled artifact
    pub code: String,
    #[builder(default = true)]
    pub is_bundled: bool,

    #[builder(default = true)]
    pub enabled: bool,

    // Cron binding
    #[builder(default, setter(strip_option))]
    pub schedule: Option<String>,
    #[builder(default, setter(strip_option))]
    pub schedule_params: Option<serde_json::Value>,

    // Execution budgets
    #[builder(default = 300)]
    pub timeout_seconds: i64,
    #[builder(default = 300)]
    pub progress_timeout_seconds: i64,
    #[builder(default = 256)]
    pub memory_limit_mb: i64,
    #[builder(default = 0)]
    pub max_retries: i32,

    // Sandbox permissions
    #[builder(default = true)]
    pub allow_net: bool,
    #[builder(default = true)]
    pub allow_env: bool,
    #[builder(default = false)]
    pub allow_read: bool,
    #[builder(default = false)]
    pub allow_write: bool,

    #[builder(default)]
    pub require_roles: Vec<String>,
    #[builder(default = false)]
    pub disable_execution_logs: bool,

    #[builder(default = 1)]
    pub version: i32,
    #[builder(default)]
    pub source: FunctionSource,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl JobFunction {
    /// Insert or update by `(namespace, name)`, bumping `version` on update.
    pub async fn upsert(&self, pool: &PgPool) -> Result<Self> {
        let func = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO job_functions (
                id, namespace, name, code, is_bundled, enabled,
                schedule, schedule_params, timeout_seconds, progress_timeout_seconds,
                memory_limit_mb, max_retries, allow_net, allow_env, allow_read, allow_write,
                require_roles, disable_execution_logs, version, source, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22
            )
            ON CONFLICT (namespace, name) DO UPDATE SET
                code = EXCLUDED.code,
                is_bundled = EXCLUDED.is_bundled,
                enabled = EXCLUDED.enabled,
                schedule = EXCLUDED.schedule,
                schedule_params = EXCLUDED.schedule_params,
                timeout_seconds = EXCLUDED.timeout_seconds,
                progress_timeout_seconds = EXCLUDED.progress_timeout_seconds,
                memory_limit_mb = EXCLUDED.memory_limit_mb,
                max_retries = EXCLUDED.max_retries,
                allow_net = EXCLUDED.allow_net,
                allow_env = EXCLUDED.allow_env,
                allow_read = EXCLUDED.allow_read,
                allow_write = EXCLUDED.allow_write,
                require_roles = EXCLUDED.require_roles,
                disable_execution_logs = EXCLUDED.disable_execution_logs,
                version = job_functions.version + 1,
                source = EXCLUDED.source,
                updated_at = NOW()
            RETURNING {FUNCTION_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.namespace)
        .bind(&self.name)
        .bind(&self.code)
        .bind(self.is_bundled)
        .bind(self.enabled)
        .bind(&self.schedule)
        .bind(&self.schedule_params)
        .bind(self.timeout_seconds)
        .bind(self.progress_timeout_seconds)
        .bind(self.memory_limit_mb)
        .bind(self.max_retries)
        .bind(self.allow_net)
        .bind(self.allow_env)
        .bind(self.allow_read)
        .bind(self.allow_write)
        .bind(&self.require_roles)
        .bind(self.disable_execution_logs)
        .bind(self.version)
        .bind(self.source)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await?;

        Ok(func)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let func = sqlx::query_as::<_, Self>(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM job_functions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(func)
    }

    pub async fn find_by_name(namespace: &str, name: &str, pool: &PgPool) -> Result<Option<Self>> {
        let func = sqlx::query_as::<_, Self>(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM job_functions WHERE namespace = $1 AND name = $2"
        ))
        .bind(namespace)
        .bind(name)
        .fetch_optional(pool)
        .await?;

        Ok(func)
    }

    pub async fn list(namespace: Option<&str>, pool: &PgPool) -> Result<Vec<Self>> {
        let funcs = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {FUNCTION_COLUMNS} FROM job_functions
            WHERE ($1::text IS NULL OR namespace = $1)
            ORDER BY namespace, name
            "#
        ))
        .bind(namespace)
        .fetch_all(pool)
        .await?;

        Ok(funcs)
    }

    pub async fn set_enabled(
        namespace: &str,
        name: &str,
        enabled: bool,
        pool: &PgPool,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE job_functions
            SET enabled = $3, updated_at = NOW()
            WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(namespace)
        .bind(name)
        .bind(enabled)
        .execute(pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    pub async fn delete(namespace: &str, name: &str, pool: &PgPool) -> Result<bool> {
        let done = sqlx::query("DELETE FROM job_functions WHERE namespace = $1 AND name = $2")
            .bind(namespace)
            .bind(name)
            .execute(pool)
            .await?;

        Ok(done.rows_affected() > 0)
    }
}
