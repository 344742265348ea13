//! End-to-end engine scenarios on the in-memory store and scripted runtime.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobs_engine::auth;
use jobs_engine::error::ErrorKind;
use jobs_engine::loader::FunctionLoader;
use jobs_engine::manager::WorkerManager;
use jobs_engine::runtime::RuntimeEvent;
use jobs_engine::store::{JobFunction, JobStatus, JobStore, LogLevel};
use jobs_engine::testing::{InMemoryJobStore, ScriptedBehavior, ScriptedRuntime};
use jobs_engine::token::Hs256TokenSigner;
use jobs_engine::{Caller, EngineConfig, EngineError, JobHandler, SubmitOptions};
use uuid::Uuid;

struct Harness {
    store: Arc<InMemoryJobStore>,
    runtime: Arc<ScriptedRuntime>,
    manager: Arc<WorkerManager>,
    handler: JobHandler,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("jobs_engine=debug")
        .try_init();

    let store = Arc::new(InMemoryJobStore::new());
    let runtime = Arc::new(ScriptedRuntime::new());
    let config = Arc::new(EngineConfig {
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        graceful_shutdown_timeout: Duration::from_millis(300),
        worker_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    });
    let manager = WorkerManager::new(
        store.clone(),
        runtime.clone(),
        config.clone(),
        Arc::new(Hs256TokenSigner::new("scenario-secret")),
    );
    let handler = JobHandler::new(store.clone(), manager.clone(), &config);

    Harness {
        store,
        runtime,
        manager,
        handler,
    }
}

async fn register_function(store: &InMemoryJobStore, name: &str) -> JobFunction {
    let func = JobFunction::builder()
        .namespace("default")
        .name(name)
        .code("{}")
        .build();
    store.upsert_function(func).await.unwrap()
}

async fn wait_for_status(
    store: &InMemoryJobStore,
    job_id: Uuid,
    status: JobStatus,
    timeout: Duration,
) -> jobs_engine::Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {:?} waiting for {status:?} (error: {:?})",
            job.status,
            job.error_message
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn simple_success_persists_result() {
    let h = harness();
    register_function(&h.store, "send-email").await;
    h.runtime.script(
        "send-email",
        ScriptedBehavior::succeed(serde_json::json!({"ok": true}), Duration::from_millis(20)),
    );

    h.manager.start(2).await;

    let caller = Caller::new("user-1", auth::AUTHENTICATED);
    let opts = SubmitOptions::builder()
        .payload(serde_json::json!({"to": "a@b"}))
        .build();
    let job = h.handler.submit(&caller, "send-email", opts).await.unwrap();

    let done = wait_for_status(&h.store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
    assert_eq!(done.retry_count, 0);
    assert!(done.completed_at.is_some());
    assert!(done.started_at.is_some());

    // The runtime saw the submitted payload and the caller identity.
    let requests = h.runtime.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload, Some(serde_json::json!({"to": "a@b"})));
    assert_eq!(requests[0].user_id, "user-1");
    assert!(!requests[0].jwt.is_empty());

    h.manager.stop().await;
}

#[tokio::test]
async fn timeout_requeues_then_lands_terminal_failed() {
    let h = harness();

    let mut func = JobFunction::builder()
        .namespace("default")
        .name("sleepy")
        .code("{}")
        .timeout_seconds(1_i64)
        .max_retries(1)
        .build();
    func = h.store.upsert_function(func).await.unwrap();
    assert_eq!(func.max_retries, 1);

    // The function sleeps 10 s, far past its 1 s budget.
    h.runtime.script(
        "sleepy",
        ScriptedBehavior::succeed(serde_json::json!({}), Duration::from_secs(10)),
    );

    h.manager.start(1).await;

    let job = h
        .handler
        .submit(&Caller::service(), "sleepy", SubmitOptions::default())
        .await
        .unwrap();

    let failed = wait_for_status(&h.store, job.id, JobStatus::Failed, Duration::from_secs(8)).await;
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error_kind, Some(ErrorKind::Timeout));
    assert!(failed.error_message.unwrap().contains("timed out"));
    assert_eq!(h.runtime.execution_count(), 2);

    h.manager.stop().await;
}

#[tokio::test]
async fn graceful_drain_completes_fast_jobs_and_interrupts_stragglers() {
    let h = harness();
    register_function(&h.store, "quick").await;
    register_function(&h.store, "stuck").await;

    h.runtime.script(
        "quick",
        ScriptedBehavior::succeed(serde_json::json!({"done": 1}), Duration::from_millis(30)),
    );
    h.runtime.script("stuck", ScriptedBehavior::run_until_cancelled());

    h.manager.start(2).await;

    let quick = h
        .handler
        .submit(&Caller::service(), "quick", SubmitOptions::default())
        .await
        .unwrap();
    let stuck = h
        .handler
        .submit(&Caller::service(), "stuck", SubmitOptions::default())
        .await
        .unwrap();

    wait_for_status(&h.store, quick.id, JobStatus::Completed, Duration::from_secs(5)).await;
    wait_for_status(&h.store, stuck.id, JobStatus::Running, Duration::from_secs(5)).await;

    h.manager.stop().await;

    let quick = h.store.get_job(quick.id).await.unwrap().unwrap();
    assert_eq!(quick.status, JobStatus::Completed);

    let stuck = h.store.get_job(stuck.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, JobStatus::Interrupted);
    assert!(stuck.error_message.unwrap().contains("shutdown"));
}

#[tokio::test]
async fn required_role_gates_submission_end_to_end() {
    let h = harness();

    // Function declared through the loader's annotation path.
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("wipe-tenant.ts"),
        "// @fluxbase:require-role admin\nexport default async () => ({ wiped: true });",
    );
    let loader = FunctionLoader::new(h.store.clone(), "default");
    loader.load_directory(dir.path()).await.unwrap();

    h.runtime.script(
        "wipe-tenant",
        ScriptedBehavior::succeed(serde_json::json!({"wiped": true}), Duration::from_millis(10)),
    );

    h.manager.start(1).await;

    let err = h
        .handler
        .submit(
            &Caller::new("user-1", auth::AUTHENTICATED),
            "wipe-tenant",
            SubmitOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(h
        .handler
        .list_jobs(&Caller::service(), Default::default())
        .await
        .unwrap()
        .is_empty());

    let job = h
        .handler
        .submit(&Caller::service(), "wipe-tenant", SubmitOptions::default())
        .await
        .unwrap();
    let done = wait_for_status(&h.store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.result, Some(serde_json::json!({"wiped": true})));

    h.manager.stop().await;
}

#[tokio::test]
async fn dead_worker_jobs_are_reaped_and_finished_elsewhere() {
    let h = harness();

    let mut func = JobFunction::builder()
        .namespace("default")
        .name("resilient")
        .code("{}")
        .max_retries(2)
        .build();
    func = h.store.upsert_function(func).await.unwrap();
    assert!(func.enabled);

    // A worker that stopped heartbeating while holding a running job.
    let ghost = jobs_engine::store::WorkerRecord::builder()
        .name("worker-ghost@lost")
        .hostname("lost")
        .build();
    h.store.register_worker(ghost).await.unwrap();

    let job = h
        .handler
        .submit(&Caller::service(), "resilient", SubmitOptions::default())
        .await
        .unwrap();
    let claimed = h
        .store
        .claim_next("worker-ghost@lost", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job.id);

    let report = h
        .store
        .reap_dead_workers(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.workers_stopped, 1);
    assert_eq!(report.jobs_requeued, 1);

    let requeued = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);

    // A live worker picks the job back up and finishes it.
    h.manager.start(1).await;
    let done = wait_for_status(&h.store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));

    h.manager.stop().await;
}

#[tokio::test]
async fn execution_logs_stream_unless_disabled() {
    let h = harness();

    register_function(&h.store, "chatty").await;
    let mut quiet = JobFunction::builder()
        .namespace("default")
        .name("quiet")
        .code("{}")
        .disable_execution_logs(true)
        .build();
    quiet = h.store.upsert_function(quiet).await.unwrap();
    assert!(quiet.disable_execution_logs);

    let events = vec![
        RuntimeEvent::Log {
            level: LogLevel::Info,
            message: "starting".to_string(),
        },
        RuntimeEvent::Progress(serde_json::json!({"pct": 50})),
        RuntimeEvent::Log {
            level: LogLevel::Warn,
            message: "halfway".to_string(),
        },
    ];
    h.runtime.script(
        "chatty",
        ScriptedBehavior::succeed(serde_json::json!({}), Duration::from_millis(30))
            .with_events(events.clone()),
    );
    h.runtime.script(
        "quiet",
        ScriptedBehavior::succeed(serde_json::json!({}), Duration::from_millis(30))
            .with_events(events),
    );

    h.manager.start(2).await;

    let chatty = h
        .handler
        .submit(&Caller::service(), "chatty", SubmitOptions::default())
        .await
        .unwrap();
    let quiet = h
        .handler
        .submit(&Caller::service(), "quiet", SubmitOptions::default())
        .await
        .unwrap();

    wait_for_status(&h.store, chatty.id, JobStatus::Completed, Duration::from_secs(5)).await;
    wait_for_status(&h.store, quiet.id, JobStatus::Completed, Duration::from_secs(5)).await;

    let chatty_logs = h.store.get_logs(chatty.id, None).await.unwrap();
    assert_eq!(chatty_logs.len(), 2);
    assert_eq!(chatty_logs[0].line_number, 1);
    assert_eq!(chatty_logs[0].message, "starting");
    assert_eq!(chatty_logs[1].line_number, 2);

    let chatty_job = h.store.get_job(chatty.id).await.unwrap().unwrap();
    assert_eq!(chatty_job.progress, Some(serde_json::json!({"pct": 50})));

    // disable_execution_logs suppresses the log stream entirely.
    assert!(h.store.get_logs(quiet.id, None).await.unwrap().is_empty());

    h.manager.stop().await;
}

#[tokio::test]
async fn operator_cancel_stops_a_running_job() {
    let h = harness();
    register_function(&h.store, "long-haul").await;
    h.runtime
        .script("long-haul", ScriptedBehavior::run_until_cancelled());

    h.manager.start(1).await;

    let job = h
        .handler
        .submit(&Caller::service(), "long-haul", SubmitOptions::default())
        .await
        .unwrap();
    wait_for_status(&h.store, job.id, JobStatus::Running, Duration::from_secs(5)).await;

    let cancelled = h.handler.terminate(&Caller::service(), job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(!h.manager.is_job_running(job.id).await);

    h.manager.stop().await;
}

#[tokio::test]
async fn child_crash_retries_then_fails() {
    let h = harness();

    let func = JobFunction::builder()
        .namespace("default")
        .name("crashy")
        .code("{}")
        .max_retries(1)
        .build();
    h.store.upsert_function(func).await.unwrap();
    h.runtime.script(
        "crashy",
        ScriptedBehavior::crash("exit status 1", Duration::from_millis(20)),
    );

    h.manager.start(1).await;

    let job = h
        .handler
        .submit(&Caller::service(), "crashy", SubmitOptions::default())
        .await
        .unwrap();

    let failed = wait_for_status(&h.store, job.id, JobStatus::Failed, Duration::from_secs(5)).await;
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error_kind, Some(ErrorKind::ChildCrash));
    assert_eq!(h.runtime.execution_count(), 2);

    h.manager.stop().await;
}

#[tokio::test]
async fn cron_registration_enforces_minimum_interval() {
    let h = harness();
    let config = EngineConfig::default();
    let scheduler = jobs_engine::CronScheduler::new(h.store.clone(), &config)
        .await
        .unwrap();

    let fast = JobFunction::builder()
        .namespace("default")
        .name("every-30s")
        .code("{}")
        .schedule("*/30 * * * * *")
        .build();
    let err = scheduler.schedule(&fast).await.unwrap_err();
    match &err {
        EngineError::CronInterval(detail) => {
            assert!(detail.to_string().contains("30s"));
            assert!(detail.to_string().contains("1m0s"));
        }
        other => panic!("expected cron interval error, got {other}"),
    }
    assert!(!scheduler.is_scheduled("default", "every-30s").await);

    let fine = JobFunction::builder()
        .namespace("default")
        .name("every-5m")
        .code("{}")
        .schedule("*/5 * * * *")
        .build();
    scheduler.schedule(&fine).await.unwrap();
    assert!(scheduler.is_scheduled("default", "every-5m").await);

    scheduler.shutdown().await.unwrap();
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
