//! Job worker: poll → claim → execute → report.
//!
//! Each worker owns a poll loop, a heartbeat loop, and one event pump per
//! running job. Jobs run in their own tasks so user code can never stall the
//! poll loop; cancellation is cooperative through a per-job token the runtime
//! observes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{format_interval, EngineError, ErrorKind, Result};
use crate::executor::build_execution_request;
use crate::runtime::{Runtime, RuntimeError, RuntimeEvent};
use crate::secrets::SettingsSecretsService;
use crate::store::{Job, JobStore, LogLine, WorkerRecord, WorkerStatus};
use crate::token::TokenSigner;

/// Why a running job's token was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Operator,
    Shutdown,
}

/// Which worker-side timer fired first, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForcedStop {
    Timeout(Duration),
    ProgressTimeout(Duration),
}

struct RunningJob {
    cancel: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
    logs_disabled: bool,
}

/// A single executor thread of the engine.
pub struct Worker {
    id: Uuid,
    name: String,
    hostname: String,
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn Runtime>,
    config: Arc<EngineConfig>,
    signer: Arc<dyn TokenSigner>,
    secrets: RwLock<Option<Arc<dyn SettingsSecretsService>>>,
    running: Arc<RwLock<HashMap<Uuid, Arc<RunningJob>>>>,
    draining: AtomicBool,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn Runtime>,
        config: Arc<EngineConfig>,
        signer: Arc<dyn TokenSigner>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let short = id.simple().to_string();
        let name = format!("worker-{}@{}", &short[..8], hostname);

        Arc::new(Self {
            id,
            name,
            hostname,
            store,
            runtime,
            config,
            signer,
            secrets: RwLock::new(None),
            running: Arc::new(RwLock::new(HashMap::new())),
            draining: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inject the settings/secrets service after construction.
    pub async fn set_secrets_service(&self, service: Arc<dyn SettingsSecretsService>) {
        *self.secrets.write().await = Some(service);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    pub async fn is_running(&self, job_id: Uuid) -> bool {
        self.running.read().await.contains_key(&job_id)
    }

    /// Trigger cooperative cancellation for a job this worker owns.
    ///
    /// Returns false when the job is not running here. Never blocks on the
    /// job actually stopping.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let entry = self.running.read().await.get(&job_id).cloned();
        match entry {
            Some(tracked) => {
                tracked.reason.lock().await.get_or_insert(CancelReason::Operator);
                tracked.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Run until `shutdown` fires, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let record = WorkerRecord::builder()
            .id(self.id)
            .name(self.name.clone())
            .hostname(self.hostname.clone())
            .max_concurrent_jobs(self.config.max_concurrent_jobs)
            .metadata(serde_json::json!({
                "pid": std::process::id(),
                "hostname": self.hostname.clone(),
            }))
            .build();
        self.store.register_worker(record).await?;

        info!(worker = %self.name, "worker starting");

        // Liveness keeps its own stop signal so heartbeats continue through
        // the drain window.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_handle = tokio::spawn(Self::heartbeat_loop(
            self.clone(),
            heartbeat_stop.clone(),
        ));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if !self.is_draining() && self.has_capacity().await {
                match self.store.claim_next(&self.name, None).await {
                    Ok(Some(job)) => {
                        debug!(worker = %self.name, job_id = %job.id, job_name = %job.job_name, "claimed job");
                        let worker = self.clone();
                        tokio::spawn(async move {
                            worker.process_job(job).await;
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(worker = %self.name, error = %e, "failed to claim job");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        self.drain().await;

        heartbeat_stop.cancel();
        let _ = heartbeat_handle.await;

        self.store
            .set_worker_status(&self.name, WorkerStatus::Stopped)
            .await?;

        info!(worker = %self.name, "worker stopped");
        Ok(())
    }

    async fn has_capacity(&self) -> bool {
        (self.running.read().await.len() as i32) < self.config.max_concurrent_jobs
    }

    async fn heartbeat_loop(worker: Arc<Worker>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(worker.config.heartbeat_interval);
        ticker.tick().await; // registration already stamped liveness

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let count = worker.running.read().await.len() as i32;
                    if let Err(e) = worker.store.worker_heartbeat(&worker.name, count).await {
                        warn!(worker = %worker.name, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    /// Finish running jobs within the graceful window, then cancel stragglers.
    async fn drain(&self) {
        self.set_draining(true);
        if let Err(e) = self
            .store
            .set_worker_status(&self.name, WorkerStatus::Draining)
            .await
        {
            warn!(worker = %self.name, error = %e, "failed to mark draining");
        }

        let deadline = Instant::now() + self.config.graceful_shutdown_timeout;
        while self.running_count().await > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        let stragglers: Vec<Arc<RunningJob>> =
            self.running.read().await.values().cloned().collect();
        if !stragglers.is_empty() {
            info!(worker = %self.name, count = stragglers.len(), "cancelling jobs at shutdown");
            for tracked in stragglers {
                tracked.reason.lock().await.get_or_insert(CancelReason::Shutdown);
                tracked.cancel.cancel();
            }
        }

        // Give the cancelled jobs a moment to persist their terminal state.
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.running_count().await > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn process_job(self: Arc<Self>, job: Job) {
        let job_id = job.id;

        let func = match self
            .store
            .get_function_by_name(&job.namespace, &job.job_name)
            .await
        {
            Ok(Some(func)) => func,
            Ok(None) => {
                self.finish_failed(
                    job_id,
                    &format!("function {}/{} not found", job.namespace, job.job_name),
                    ErrorKind::Validation,
                    false,
                )
                .await;
                return;
            }
            Err(e) => {
                self.finish_failed(job_id, &e.to_string(), ErrorKind::Storage, true)
                    .await;
                return;
            }
        };

        let tracked = Arc::new(RunningJob {
            cancel: CancellationToken::new(),
            reason: Mutex::new(None),
            logs_disabled: func.disable_execution_logs,
        });
        self.running.write().await.insert(job_id, tracked.clone());

        let secrets = self.secrets.read().await.clone();
        let request = match build_execution_request(
            &job,
            &func,
            &self.config,
            secrets.as_ref(),
            self.signer.as_ref(),
        )
        .await
        {
            Ok(request) => request,
            Err(e) => {
                self.finish_failed(job_id, &e.to_string(), e.kind(), e.should_retry())
                    .await;
                self.release(job_id, &tracked).await;
                return;
            }
        };

        let timeout = request.timeout;
        let progress_timeout = request.progress_timeout;

        let (events_tx, mut events_rx) = mpsc::channel::<RuntimeEvent>(64);
        let mut exec = Box::pin(
            self.runtime
                .execute(tracked.cancel.clone(), request, events_tx),
        );

        let timeout_at = Instant::now() + timeout;
        let mut silence_at = Instant::now() + progress_timeout;
        let mut events_open = true;
        let mut forced: Option<ForcedStop> = None;

        // Pump events while racing the runtime against both budget timers.
        let outcome = loop {
            tokio::select! {
                result = &mut exec => break result,
                event = events_rx.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            silence_at = Instant::now() + progress_timeout;
                            self.persist_event(job_id, &tracked, event).await;
                        }
                        None => events_open = false,
                    }
                }
                _ = sleep_until(timeout_at), if forced.is_none() => {
                    forced = Some(ForcedStop::Timeout(timeout));
                    tracked.cancel.cancel();
                }
                _ = sleep_until(silence_at), if forced.is_none() => {
                    forced = Some(ForcedStop::ProgressTimeout(progress_timeout));
                    tracked.cancel.cancel();
                }
            }
        };

        // Events produced before the result must land before the terminal
        // transition.
        while let Ok(event) = events_rx.try_recv() {
            self.persist_event(job_id, &tracked, event).await;
        }

        let reason = *tracked.reason.lock().await;
        self.report_outcome(job_id, outcome, forced, reason).await;

        self.release(job_id, &tracked).await;
    }

    /// Drop the tracking entry, but only if it is still ours. A requeued job
    /// can be re-claimed by this worker before the old task gets here.
    async fn release(&self, job_id: Uuid, tracked: &Arc<RunningJob>) {
        let mut running = self.running.write().await;
        if running
            .get(&job_id)
            .is_some_and(|current| Arc::ptr_eq(current, tracked))
        {
            running.remove(&job_id);
        }
    }

    async fn persist_event(&self, job_id: Uuid, tracked: &RunningJob, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Log { level, message } => {
                if tracked.logs_disabled {
                    return;
                }
                let line = LogLine { level, message };
                if let Err(e) = self.store.append_logs(job_id, &[line]).await {
                    warn!(job_id = %job_id, error = %e, "failed to append log");
                }
            }
            RuntimeEvent::Progress(snapshot) => {
                if let Err(e) = self.store.append_progress(job_id, snapshot).await {
                    warn!(job_id = %job_id, error = %e, "failed to record progress");
                }
            }
        }
    }

    async fn report_outcome(
        &self,
        job_id: Uuid,
        outcome: std::result::Result<serde_json::Value, RuntimeError>,
        forced: Option<ForcedStop>,
        reason: Option<CancelReason>,
    ) {
        match forced {
            Some(ForcedStop::Timeout(limit)) => {
                let message = EngineError::Timeout(limit).to_string();
                self.finish_failed(job_id, &message, ErrorKind::Timeout, true)
                    .await;
                return;
            }
            Some(ForcedStop::ProgressTimeout(limit)) => {
                let message = EngineError::ProgressTimeout(limit).to_string();
                self.finish_failed(job_id, &message, ErrorKind::Timeout, true)
                    .await;
                return;
            }
            None => {}
        }

        match outcome {
            Ok(result) => {
                debug!(job_id = %job_id, "job completed");
                if let Err(e) = self.store.complete_job(job_id, result).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job completed");
                }
            }
            Err(RuntimeError::Cancelled) => match reason {
                Some(CancelReason::Shutdown) => {
                    let message = format!(
                        "worker shutdown after {} grace",
                        format_interval(&self.config.graceful_shutdown_timeout)
                    );
                    if let Err(e) = self.store.interrupt_job(job_id, &message).await {
                        error!(job_id = %job_id, error = %e, "failed to mark job interrupted");
                    }
                }
                _ => {
                    if let Err(e) = self
                        .store
                        .cancel_job(job_id, Some("cancelled by operator"))
                        .await
                    {
                        error!(job_id = %job_id, error = %e, "failed to mark job cancelled");
                    }
                }
            },
            Err(RuntimeError::Timeout(limit)) => {
                let message = EngineError::Timeout(limit).to_string();
                self.finish_failed(job_id, &message, ErrorKind::Timeout, true)
                    .await;
            }
            Err(RuntimeError::ProgressTimeout(limit)) => {
                let message = EngineError::ProgressTimeout(limit).to_string();
                self.finish_failed(job_id, &message, ErrorKind::Timeout, true)
                    .await;
            }
            Err(RuntimeError::ChildCrash(detail)) => {
                self.finish_failed(job_id, &detail, ErrorKind::ChildCrash, true)
                    .await;
            }
            Err(RuntimeError::Setup(detail)) => {
                self.finish_failed(job_id, &detail, ErrorKind::Validation, false)
                    .await;
            }
        }
    }

    async fn finish_failed(&self, job_id: Uuid, message: &str, kind: ErrorKind, retryable: bool) {
        warn!(job_id = %job_id, kind = %kind, error = %message, "job failed");
        if let Err(e) = self.store.fail_job(job_id, message, kind, retryable).await {
            error!(job_id = %job_id, error = %e, "failed to mark job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryJobStore, ScriptedRuntime};
    use crate::token::Hs256TokenSigner;

    fn test_worker(store: Arc<InMemoryJobStore>, runtime: Arc<ScriptedRuntime>) -> Arc<Worker> {
        let config = Arc::new(EngineConfig {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            graceful_shutdown_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        });
        Worker::new(store, runtime, config, Arc::new(Hs256TokenSigner::new("test")))
    }

    #[tokio::test]
    async fn worker_name_includes_host() {
        let store = Arc::new(InMemoryJobStore::new());
        let runtime = Arc::new(ScriptedRuntime::new());
        let worker = test_worker(store, runtime);
        assert!(worker.name().starts_with("worker-"));
        assert!(worker.name().contains('@'));
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_false() {
        let store = Arc::new(InMemoryJobStore::new());
        let runtime = Arc::new(ScriptedRuntime::new());
        let worker = test_worker(store, runtime);
        assert!(!worker.cancel(Uuid::new_v4()).await);
    }
}
