//! Worker pool manager: owns N workers, supervises crashes, reaps the dead.
//!
//! The manager is a process-wide singleton with an explicit `start`/`stop`
//! lifecycle wired by the embedding host. Worker exits flow through a bounded
//! channel to the supervisor, which restarts crashed slots with exponential
//! backoff; restart counts never decay for the supervisor's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::runtime::Runtime;
use crate::secrets::SettingsSecretsService;
use crate::store::JobStore;
use crate::token::TokenSigner;
use crate::worker::Worker;

const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

struct WorkerExit {
    slot: usize,
    error: Option<String>,
}

/// Supervises the worker roster.
pub struct WorkerManager {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn Runtime>,
    config: Arc<EngineConfig>,
    signer: Arc<dyn TokenSigner>,
    secrets: RwLock<Option<Arc<dyn SettingsSecretsService>>>,
    workers: Arc<RwLock<HashMap<usize, Arc<Worker>>>>,
    restart_counts: Mutex<HashMap<usize, u32>>,
    shutdown: Mutex<Option<CancellationToken>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn Runtime>,
        config: Arc<EngineConfig>,
        signer: Arc<dyn TokenSigner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime,
            config,
            signer,
            secrets: RwLock::new(None),
            workers: Arc::new(RwLock::new(HashMap::new())),
            restart_counts: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(None),
            supervisor: Mutex::new(None),
            reaper: Mutex::new(None),
        })
    }

    /// Inject the settings/secrets service; propagated to current and future
    /// workers.
    pub async fn set_secrets_service(self: &Arc<Self>, service: Arc<dyn SettingsSecretsService>) {
        *self.secrets.write().await = Some(service.clone());
        for worker in self.workers.read().await.values() {
            worker.set_secrets_service(service.clone()).await;
        }
    }

    /// Launch `worker_count` workers plus the supervision and reap loops.
    pub async fn start(self: &Arc<Self>, worker_count: usize) {
        let mut shutdown_slot = self.shutdown.lock().await;
        if shutdown_slot.is_some() {
            warn!("worker manager already started");
            return;
        }

        let shutdown = CancellationToken::new();
        *shutdown_slot = Some(shutdown.clone());
        drop(shutdown_slot);

        info!(worker_count, "starting worker manager");

        let (exit_tx, exit_rx) = mpsc::channel::<WorkerExit>(worker_count.max(1) * 2);

        for slot in 0..worker_count {
            self.spawn_worker(slot, shutdown.clone(), exit_tx.clone())
                .await;
        }

        let supervisor = tokio::spawn(Self::supervise(
            self.clone(),
            worker_count,
            shutdown.clone(),
            exit_tx,
            exit_rx,
        ));
        *self.supervisor.lock().await = Some(supervisor);

        let reaper = tokio::spawn(Self::reap_loop(self.clone(), shutdown));
        *self.reaper.lock().await = Some(reaper);
    }

    /// Stop every worker and wait for them to drain. Idempotent.
    pub async fn stop(&self) {
        let Some(shutdown) = self.shutdown.lock().await.take() else {
            return;
        };

        info!("stopping worker manager");
        shutdown.cancel();

        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.reaper.lock().await.take() {
            let _ = handle.await;
        }

        // Workers remove themselves once their drain completes.
        let deadline =
            Instant::now() + self.config.graceful_shutdown_timeout + Duration::from_secs(10);
        while !self.workers.read().await.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        self.workers.write().await.clear();
        info!("worker manager stopped");
    }

    /// Broadcast a cancellation; only the owning worker acts on it.
    pub async fn cancel_job(&self, job_id: Uuid) -> bool {
        for worker in self.workers.read().await.values() {
            if worker.cancel(job_id).await {
                return true;
            }
        }
        false
    }

    /// Whether any live worker currently runs this job.
    pub async fn is_job_running(&self, job_id: Uuid) -> bool {
        for worker in self.workers.read().await.values() {
            if worker.is_running(job_id).await {
                return true;
            }
        }
        false
    }

    pub async fn worker_names(&self) -> Vec<String> {
        self.workers
            .read()
            .await
            .values()
            .map(|w| w.name().to_string())
            .collect()
    }

    async fn spawn_worker(
        self: &Arc<Self>,
        slot: usize,
        shutdown: CancellationToken,
        exit_tx: mpsc::Sender<WorkerExit>,
    ) {
        let worker = Worker::new(
            self.store.clone(),
            self.runtime.clone(),
            self.config.clone(),
            self.signer.clone(),
        );

        if let Some(service) = self.secrets.read().await.clone() {
            worker.set_secrets_service(service).await;
        }

        self.workers.write().await.insert(slot, worker.clone());

        let workers = self.workers.clone();
        tokio::spawn(async move {
            let name = worker.name().to_string();
            let result = std::panic::AssertUnwindSafe(worker.run(shutdown))
                .catch_unwind()
                .await;

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("worker panicked".to_string()),
            };

            if let Some(ref e) = error {
                error!(worker = %name, slot, error = %e, "worker exited abnormally");
            }

            workers.write().await.remove(&slot);
            let _ = exit_tx.send(WorkerExit { slot, error }).await;
        });
    }

    /// Restart crashed workers with backoff until the restart budget runs out.
    ///
    /// Holds its own exit sender so replacements keep reporting through the
    /// same channel.
    async fn supervise(
        manager: Arc<Self>,
        target: usize,
        shutdown: CancellationToken,
        exit_tx: mpsc::Sender<WorkerExit>,
        mut exit_rx: mpsc::Receiver<WorkerExit>,
    ) {
        loop {
            let exit = tokio::select! {
                _ = shutdown.cancelled() => break,
                exit = exit_rx.recv() => match exit {
                    Some(exit) => exit,
                    None => break,
                },
            };

            if shutdown.is_cancelled() {
                break;
            }

            if exit.error.is_none() {
                warn!(slot = exit.slot, "worker exited cleanly outside shutdown");
            }

            let restarts = {
                let mut counts = manager.restart_counts.lock().await;
                let entry = counts.entry(exit.slot).or_insert(0);
                *entry += 1;
                *entry
            };

            if restarts > manager.config.max_restarts {
                error!(
                    slot = exit.slot,
                    restarts, "worker exceeded restart budget, leaving slot empty"
                );
                continue;
            }

            let backoff =
                Duration::from_secs(1u64 << (restarts - 1).min(5)).min(MAX_RESTART_BACKOFF);
            warn!(
                slot = exit.slot,
                restarts,
                backoff_ms = backoff.as_millis() as u64,
                "restarting worker"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(backoff) => {}
            }

            if manager.workers.read().await.len() >= target {
                continue;
            }

            manager
                .spawn_worker(exit.slot, shutdown.clone(), exit_tx.clone())
                .await;
        }
    }

    /// Periodically flip silent workers to stopped and recover their jobs.
    async fn reap_loop(manager: Arc<Self>, shutdown: CancellationToken) {
        let worker_timeout = manager.config.worker_timeout;
        let mut ticker = tokio::time::interval((worker_timeout / 2).max(Duration::from_secs(1)));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(worker_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    match manager.store.reap_dead_workers(cutoff).await {
                        Ok(report) if report.workers_stopped > 0 => {
                            warn!(
                                workers_stopped = report.workers_stopped,
                                jobs_requeued = report.jobs_requeued,
                                jobs_interrupted = report.jobs_interrupted,
                                "reaped dead workers"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dead worker reap failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryJobStore, ScriptedRuntime};
    use crate::token::Hs256TokenSigner;

    fn test_manager() -> Arc<WorkerManager> {
        let store = Arc::new(InMemoryJobStore::new());
        let runtime = Arc::new(ScriptedRuntime::new());
        let config = Arc::new(EngineConfig {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            graceful_shutdown_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        });
        WorkerManager::new(store, runtime, config, Arc::new(Hs256TokenSigner::new("test")))
    }

    #[tokio::test]
    async fn start_spawns_requested_workers_and_stop_is_idempotent() {
        let manager = test_manager();
        manager.start(3).await;

        // Workers register asynchronously; give the tasks a tick.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.worker_names().await.len(), 3);

        manager.stop().await;
        assert!(manager.worker_names().await.is_empty());

        // Second stop is a no-op.
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancel_job_without_owner_returns_false() {
        let manager = test_manager();
        manager.start(1).await;
        sleep(Duration::from_millis(30)).await;

        assert!(!manager.cancel_job(Uuid::new_v4()).await);

        manager.stop().await;
    }
}
