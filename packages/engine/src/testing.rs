//! Test doubles: an in-memory store and a scripted runtime.
//!
//! `InMemoryJobStore` implements the full [`JobStore`] contract for tests and
//! single-process embedding, including the single-claim guarantee and the
//! in-memory "last-fired-for-minute" gate the cron contract requires without
//! a database. `ScriptedRuntime` stands in for the sandbox driver.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};
use crate::runtime::{ExecutionRequest, Runtime, RuntimeError, RuntimeEvent};
use crate::store::{
    ExecutionLog, FailDisposition, Job, JobFilter, JobFunction, JobStats, JobStatus, JobStore,
    LogLine, ReapReport, WorkerRecord, WorkerStatus,
};

/// In-memory [`JobStore`] double.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    functions: RwLock<HashMap<(String, String), JobFunction>>,
    workers: RwLock<HashMap<String, WorkerRecord>>,
    logs: RwLock<HashMap<Uuid, Vec<ExecutionLog>>>,
    fired: RwLock<HashSet<String>>,
    log_ids: AtomicI64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<Job> {
        self.write_jobs().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.read_jobs().get(&id).cloned())
    }

    async fn claim_next(&self, worker_name: &str, namespace: Option<&str>) -> Result<Option<Job>> {
        let enabled: HashSet<(String, String)> = {
            let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
            functions
                .values()
                .filter(|f| f.enabled)
                .map(|f| (f.namespace.clone(), f.name.clone()))
                .collect()
        };

        let now = Utc::now();
        let mut jobs = self.write_jobs();

        let candidate = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| j.scheduled_at.is_none_or(|at| at <= now))
            .filter(|j| namespace.is_none_or(|ns| j.namespace == ns))
            .filter(|j| enabled.contains(&(j.namespace.clone(), j.job_name.clone())))
            .min_by_key(|j| {
                (
                    std::cmp::Reverse(j.priority),
                    j.scheduled_at.unwrap_or(j.created_at),
                    j.created_at,
                )
            })
            .map(|j| j.id);

        if let Some(job) = candidate.and_then(|id| jobs.get_mut(&id)) {
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_name.to_string());
            job.started_at = Some(now);
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn complete_job(&self, id: Uuid, result: serde_json::Value) -> Result<bool> {
        let mut jobs = self.write_jobs();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(
        &self,
        id: Uuid,
        message: &str,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailDisposition> {
        let mut jobs = self.write_jobs();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(FailDisposition::Noop);
        };
        if job.status != JobStatus::Running {
            return Ok(FailDisposition::Noop);
        }

        job.error_message = Some(message.to_string());
        job.error_kind = Some(kind);
        job.updated_at = Utc::now();

        if retryable && job.retry_count < job.max_retries {
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.worker_id = None;
            job.started_at = None;
            Ok(FailDisposition::Requeued)
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            Ok(FailDisposition::Terminal)
        }
    }

    async fn cancel_job(&self, id: Uuid, message: Option<&str>) -> Result<bool> {
        let mut jobs = self.write_jobs();
        match jobs.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Cancelled;
                job.error_kind = Some(ErrorKind::Cancelled);
                if let Some(message) = message {
                    job.error_message = Some(message.to_string());
                }
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn interrupt_job(&self, id: Uuid, message: &str) -> Result<FailDisposition> {
        let mut jobs = self.write_jobs();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(FailDisposition::Noop);
        };
        if job.status != JobStatus::Running {
            return Ok(FailDisposition::Noop);
        }

        job.error_message = Some(message.to_string());
        job.error_kind = Some(ErrorKind::Interrupted);
        job.updated_at = Utc::now();

        if job.retry_count < job.max_retries {
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.worker_id = None;
            job.started_at = None;
            Ok(FailDisposition::Requeued)
        } else {
            job.status = JobStatus::Interrupted;
            job.completed_at = Some(Utc::now());
            Ok(FailDisposition::Terminal)
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.read_jobs();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| filter.namespace.as_ref().is_none_or(|ns| &j.namespace == ns))
            .filter(|j| filter.job_name.as_ref().is_none_or(|n| &j.job_name == n))
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| {
                filter
                    .created_by
                    .as_ref()
                    .is_none_or(|c| j.created_by.as_ref() == Some(c))
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 { 50 } else { filter.limit } as usize;
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn job_stats(&self, namespace: Option<&str>) -> Result<JobStats> {
        let jobs = self.read_jobs();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            if namespace.is_none_or(|ns| job.namespace == ns) {
                stats.record(job.status, 1);
            }
        }
        Ok(stats)
    }

    async fn find_outstanding_duplicate(
        &self,
        namespace: &str,
        job_name: &str,
        payload_hash: &str,
    ) -> Result<Option<Uuid>> {
        let jobs = self.read_jobs();
        Ok(jobs
            .values()
            .find(|j| {
                j.namespace == namespace
                    && j.job_name == job_name
                    && j.payload_hash.as_deref() == Some(payload_hash)
                    && matches!(j.status, JobStatus::Pending | JobStatus::Running)
            })
            .map(|j| j.id))
    }

    async fn append_progress(&self, id: Uuid, snapshot: serde_json::Value) -> Result<()> {
        let mut jobs = self.write_jobs();
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Running {
                job.progress = Some(snapshot);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn append_logs(&self, id: Uuid, batch: &[LogLine]) -> Result<()> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let stream = logs.entry(id).or_default();
        let mut next = stream.last().map(|l| l.line_number + 1).unwrap_or(1);
        for line in batch {
            stream.push(ExecutionLog {
                id: self.log_ids.fetch_add(1, Ordering::SeqCst) + 1,
                job_id: id,
                line_number: next,
                level: line.level,
                message: line.message.clone(),
                created_at: Utc::now(),
            });
            next += 1;
        }
        Ok(())
    }

    async fn get_logs(&self, id: Uuid, after_line: Option<i64>) -> Result<Vec<ExecutionLog>> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let after = after_line.unwrap_or(0);
        Ok(logs
            .get(&id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|l| l.line_number > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_function(&self, func: JobFunction) -> Result<JobFunction> {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        let key = (func.namespace.clone(), func.name.clone());
        let stored = match functions.get(&key) {
            Some(existing) => JobFunction {
                id: existing.id,
                created_at: existing.created_at,
                version: existing.version + 1,
                updated_at: Utc::now(),
                ..func
            },
            None => func,
        };
        functions.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_function(&self, id: Uuid) -> Result<Option<JobFunction>> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        Ok(functions.values().find(|f| f.id == id).cloned())
    }

    async fn get_function_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<JobFunction>> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        Ok(functions
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_functions(&self, namespace: Option<&str>) -> Result<Vec<JobFunction>> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<JobFunction> = functions
            .values()
            .filter(|f| namespace.is_none_or(|ns| f.namespace == ns))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(matched)
    }

    async fn set_function_enabled(
        &self,
        namespace: &str,
        name: &str,
        enabled: bool,
    ) -> Result<bool> {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        match functions.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(func) => {
                func.enabled = enabled;
                func.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_function(&self, namespace: &str, name: &str) -> Result<()> {
        let running = self.read_jobs().values().any(|j| {
            j.namespace == namespace && j.job_name == name && j.status == JobStatus::Running
        });
        if running {
            return Err(EngineError::Validation(format!(
                "cannot delete {namespace}/{name}: running jobs still reference it"
            )));
        }

        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        if functions
            .remove(&(namespace.to_string(), name.to_string()))
            .is_none()
        {
            return Err(EngineError::NotFound(format!("function {namespace}/{name}")));
        }
        Ok(())
    }

    async fn register_worker(&self, worker: WorkerRecord) -> Result<WorkerRecord> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        workers.insert(worker.name.clone(), worker.clone());
        Ok(worker)
    }

    async fn worker_heartbeat(&self, name: &str, current_job_count: i32) -> Result<()> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(name) {
            worker.last_heartbeat_at = Utc::now();
            worker.current_job_count = current_job_count;
            worker.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_worker_status(&self, name: &str, status: WorkerStatus) -> Result<()> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(name) {
            worker.status = status;
            worker.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<WorkerRecord> = workers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn reap_dead_workers(&self, cutoff: DateTime<Utc>) -> Result<ReapReport> {
        let dead: Vec<String> = {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            workers
                .values_mut()
                .filter(|w| w.last_heartbeat_at < cutoff && w.status != WorkerStatus::Stopped)
                .map(|w| {
                    w.status = WorkerStatus::Stopped;
                    w.updated_at = Utc::now();
                    w.name.clone()
                })
                .collect()
        };

        if dead.is_empty() {
            return Ok(ReapReport::default());
        }

        let mut report = ReapReport {
            workers_stopped: dead.len(),
            ..ReapReport::default()
        };

        let mut jobs = self.write_jobs();
        for job in jobs.values_mut() {
            let owned = job
                .worker_id
                .as_ref()
                .is_some_and(|w| dead.contains(w));
            if !owned || job.status != JobStatus::Running {
                continue;
            }

            job.error_message = Some("worker died before completion".to_string());
            job.error_kind = Some(ErrorKind::Interrupted);
            job.updated_at = Utc::now();

            if job.retry_count < job.max_retries {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.worker_id = None;
                job.started_at = None;
                report.jobs_requeued += 1;
            } else {
                job.status = JobStatus::Interrupted;
                job.completed_at = Some(Utc::now());
                report.jobs_interrupted += 1;
            }
        }

        Ok(report)
    }

    async fn fire_scheduled(
        &self,
        fire_key: &str,
        _minute_start: DateTime<Utc>,
        job: Job,
    ) -> Result<Option<Job>> {
        {
            let mut fired = self.fired.write().unwrap_or_else(|e| e.into_inner());
            if !fired.insert(fire_key.to_string()) {
                return Ok(None);
            }
        }
        self.write_jobs().insert(job.id, job.clone());
        Ok(Some(job))
    }
}

/// Behavior the scripted runtime plays for one job name.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Emit `events`, wait `delay`, return `result`.
    Succeed {
        result: serde_json::Value,
        delay: Duration,
    },
    /// Emit `events`, wait `delay`, crash.
    Crash { detail: String, delay: Duration },
    /// Run until the cancellation token fires.
    RunUntilCancelled,
}

#[derive(Debug, Clone)]
pub struct ScriptedBehavior {
    pub events: Vec<RuntimeEvent>,
    pub outcome: ScriptedOutcome,
}

impl ScriptedBehavior {
    pub fn succeed(result: serde_json::Value, delay: Duration) -> Self {
        Self {
            events: Vec::new(),
            outcome: ScriptedOutcome::Succeed { result, delay },
        }
    }

    pub fn crash(detail: impl Into<String>, delay: Duration) -> Self {
        Self {
            events: Vec::new(),
            outcome: ScriptedOutcome::Crash {
                detail: detail.into(),
                delay,
            },
        }
    }

    pub fn run_until_cancelled() -> Self {
        Self {
            events: Vec::new(),
            outcome: ScriptedOutcome::RunUntilCancelled,
        }
    }

    pub fn with_events(mut self, events: Vec<RuntimeEvent>) -> Self {
        self.events = events;
        self
    }
}

/// [`Runtime`] double scripted per job name.
///
/// Unscripted jobs succeed quickly with `{"ok": true}`.
#[derive(Default)]
pub struct ScriptedRuntime {
    behaviors: RwLock<HashMap<String, ScriptedBehavior>>,
    requests: RwLock<Vec<ExecutionRequest>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, job_name: impl Into<String>, behavior: ScriptedBehavior) {
        self.behaviors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_name.into(), behavior);
    }

    /// Requests seen so far, in execution order.
    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn execution_count(&self) -> usize {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    async fn execute(
        &self,
        cancel: CancellationToken,
        request: ExecutionRequest,
        events: mpsc::Sender<RuntimeEvent>,
    ) -> std::result::Result<serde_json::Value, RuntimeError> {
        let behavior = {
            let behaviors = self.behaviors.read().unwrap_or_else(|e| e.into_inner());
            behaviors.get(&request.job_name).cloned().unwrap_or_else(|| {
                ScriptedBehavior::succeed(serde_json::json!({"ok": true}), Duration::from_millis(10))
            })
        };

        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        for event in behavior.events {
            let _ = events.send(event).await;
        }

        match behavior.outcome {
            ScriptedOutcome::Succeed { result, delay } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
                    _ = sleep(delay) => Ok(result),
                }
            }
            ScriptedOutcome::Crash { detail, delay } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
                    _ = sleep(delay) => Err(RuntimeError::ChildCrash(detail)),
                }
            }
            ScriptedOutcome::RunUntilCancelled => {
                cancel.cancelled().await;
                Err(RuntimeError::Cancelled)
            }
        }
    }
}
