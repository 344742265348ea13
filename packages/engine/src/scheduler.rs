//! Cron scheduler: distributed-safe enqueue of scheduled jobs.
//!
//! Each scheduled function gets an entry in a `tokio-cron-scheduler` engine.
//! When an entry fires, the instance races its peers for a storage-backed
//! advisory gate keyed by `(namespace, name, minute)`; the winner inserts one
//! pending job, losers return silently. Fire-time errors are logged and
//! swallowed; the next tick retries.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio::sync::{RwLock, Semaphore};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{SERVICE_ROLE, SYSTEM_USER};
use crate::config::EngineConfig;
use crate::error::{CronIntervalError, EngineError, Result};
use crate::store::{Job, JobFunction, JobStore};

/// Registered schedules must not fire more often than this.
pub const MIN_SCHEDULE_INTERVAL: Duration = Duration::from_secs(60);

/// Engine-wide cron scheduler. One per process.
pub struct CronScheduler {
    engine: JobScheduler,
    store: Arc<dyn JobStore>,
    /// `"<namespace>/<name>"` → cron engine entry id.
    entries: Arc<RwLock<HashMap<String, Uuid>>>,
    /// Caps in-flight enqueue operations, not job executions.
    permits: Arc<Semaphore>,
}

impl CronScheduler {
    pub async fn new(store: Arc<dyn JobStore>, config: &EngineConfig) -> Result<Arc<Self>> {
        let engine = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Storage(format!("cron engine init: {e}")))?;

        Ok(Arc::new(Self {
            engine,
            store,
            entries: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(config.scheduler_max_concurrent)),
        }))
    }

    pub async fn start(&self) -> Result<()> {
        self.engine
            .start()
            .await
            .map_err(|e| EngineError::Storage(format!("cron engine start: {e}")))?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut engine = self.engine.clone();
        engine
            .shutdown()
            .await
            .map_err(|e| EngineError::Storage(format!("cron engine shutdown: {e}")))?;
        Ok(())
    }

    /// Register (or atomically replace) the cron entry for a function.
    pub async fn schedule(&self, func: &JobFunction) -> Result<()> {
        let Some(raw) = func.schedule.as_deref() else {
            return Err(EngineError::Validation(format!(
                "function {}/{} has no schedule",
                func.namespace, func.name
            )));
        };

        let normalized = validate_schedule(raw)?;
        let key = entry_key(&func.namespace, &func.name);

        let store = self.store.clone();
        let permits = self.permits.clone();
        let namespace = func.namespace.clone();
        let name = func.name.clone();
        let params = func.schedule_params.clone();
        let function_id = func.id;
        let max_retries = func.max_retries;

        let cron_job = CronJob::new_async(normalized.as_str(), move |_entry_id, _engine| {
            let store = store.clone();
            let permits = permits.clone();
            let namespace = namespace.clone();
            let name = name.clone();
            let params = params.clone();
            Box::pin(async move {
                fire(store, permits, namespace, name, function_id, max_retries, params).await;
            })
        })
        .map_err(|e| EngineError::Validation(format!("cron entry for {key}: {e}")))?;

        let entry_id = self
            .engine
            .add(cron_job)
            .await
            .map_err(|e| EngineError::Storage(format!("adding cron entry {key}: {e}")))?;

        let previous = self.entries.write().await.insert(key.clone(), entry_id);
        if let Some(old) = previous {
            if let Err(e) = self.engine.remove(&old).await {
                warn!(key = %key, error = %e, "failed to remove replaced cron entry");
            }
        }

        info!(key = %key, schedule = %normalized, "scheduled job function");
        Ok(())
    }

    pub async fn unschedule(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = entry_key(namespace, name);
        let Some(entry_id) = self.entries.write().await.remove(&key) else {
            return Ok(false);
        };

        self.engine
            .remove(&entry_id)
            .await
            .map_err(|e| EngineError::Storage(format!("removing cron entry {key}: {e}")))?;

        info!(key = %key, "unscheduled job function");
        Ok(true)
    }

    pub async fn is_scheduled(&self, namespace: &str, name: &str) -> bool {
        self.entries
            .read()
            .await
            .contains_key(&entry_key(namespace, name))
    }

    pub async fn scheduled_jobs(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn entry_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// One firing: race the cross-instance gate, insert the pending job.
async fn fire(
    store: Arc<dyn JobStore>,
    permits: Arc<Semaphore>,
    namespace: String,
    name: String,
    function_id: Uuid,
    max_retries: i32,
    params: Option<serde_json::Value>,
) {
    let Ok(_permit) = permits.try_acquire() else {
        warn!(namespace = %namespace, name = %name, "enqueue permits exhausted, skipping fire");
        return;
    };

    let now = Utc::now();
    let minute_start = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let fire_key = format!("{namespace}/{name}:{}", minute_start.format("%Y-%m-%dT%H:%M"));

    let mut job = Job::builder()
        .namespace(namespace.clone())
        .job_name(name.clone())
        .job_function_id(function_id)
        .max_retries(max_retries)
        .created_by(SYSTEM_USER)
        .user_role(SERVICE_ROLE)
        .scheduled_at(now)
        .build();
    job.payload = params;

    match store.fire_scheduled(&fire_key, minute_start, job).await {
        Ok(Some(inserted)) => {
            info!(namespace = %namespace, name = %name, job_id = %inserted.id, "enqueued scheduled job");
        }
        Ok(None) => {
            debug!(namespace = %namespace, name = %name, "another instance handled this fire");
        }
        Err(e) => {
            error!(namespace = %namespace, name = %name, error = %e, "scheduled enqueue failed");
        }
    }
}

/// Reject schedules that fire more often than once a minute.
///
/// Returns the normalized 6-field expression the cron engine accepts.
pub fn validate_schedule(expression: &str) -> Result<String> {
    let normalized = normalize_cron(expression);

    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
        EngineError::Validation(format!("invalid cron expression {expression:?}: {e}"))
    })?;

    let mut upcoming = schedule.upcoming(Utc);
    if let (Some(first), Some(second)) = (upcoming.next(), upcoming.next()) {
        let interval = (second - first).to_std().unwrap_or_default();
        if interval < MIN_SCHEDULE_INTERVAL {
            return Err(CronIntervalError {
                expression: expression.to_string(),
                interval,
                minimum: MIN_SCHEDULE_INTERVAL,
            }
            .into());
        }
    }

    Ok(normalized)
}

/// 5-field expressions gain a seconds column; descriptors pass through.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return trimmed.to_string();
    }
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}
