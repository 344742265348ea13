//! External command surface: submit, cancel, retry, inspect.
//!
//! Every operation maps to a single storage transaction plus, for running
//! jobs, a cancellation broadcast through the manager. Authorization applies
//! the role hierarchy: admin-tier roles act on anything, everyone else only
//! on what they own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::time::{sleep, Duration, Instant};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::auth;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::manager::WorkerManager;
use crate::store::{
    ExecutionLog, Job, JobFilter, JobFunction, JobStats, JobStore, WorkerRecord,
};

/// Identity attached to every command.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Empty for anonymous callers.
    pub user_id: Option<String>,
    pub role: String,
    pub email: Option<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: role.into(),
            email: None,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: auth::ANON.to_string(),
            email: None,
        }
    }

    pub fn service() -> Self {
        Self {
            user_id: Some(auth::SYSTEM_USER.to_string()),
            role: auth::SERVICE_ROLE.to_string(),
            email: None,
        }
    }

    fn is_admin_tier(&self) -> bool {
        auth::is_admin_tier(&self.role)
    }

    fn owns(&self, job: &Job) -> bool {
        match (&self.user_id, &job.created_by) {
            (Some(caller), Some(owner)) => caller == owner,
            _ => false,
        }
    }
}

/// Submission options.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct SubmitOptions {
    #[builder(default, setter(into, strip_option))]
    pub namespace: Option<String>,
    #[builder(default, setter(strip_option))]
    pub payload: Option<serde_json::Value>,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Opt-in duplicate guard against outstanding jobs with the same payload.
    #[builder(default = false)]
    pub dedupe: bool,
}

/// Thin command handler over the store and manager.
pub struct JobHandler {
    store: Arc<dyn JobStore>,
    manager: Arc<WorkerManager>,
    default_namespace: String,
}

impl JobHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        manager: Arc<WorkerManager>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            manager,
            default_namespace: config.default_namespace.clone(),
        }
    }

    /// Resolve the function, authorize the caller, insert a pending job.
    pub async fn submit(&self, caller: &Caller, name: &str, opts: SubmitOptions) -> Result<Job> {
        let namespace = opts
            .namespace
            .unwrap_or_else(|| self.default_namespace.clone());

        let func = self
            .store
            .get_function_by_name(&namespace, name)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown function {namespace}/{name}"))
            })?;

        if !func.enabled {
            return Err(EngineError::Validation(format!(
                "function {namespace}/{name} is disabled"
            )));
        }

        if !auth::satisfies_any(&caller.role, &func.require_roles) {
            return Err(EngineError::Authorization(format!(
                "function {namespace}/{name} requires one of: {}",
                func.require_roles.join(", ")
            )));
        }

        let hash = payload_hash(opts.payload.as_ref());
        if opts.dedupe {
            if let Some(existing) = self
                .store
                .find_outstanding_duplicate(&namespace, name, &hash)
                .await?
            {
                return Err(EngineError::Duplicate { existing });
            }
        }

        let mut job = Job::builder()
            .namespace(namespace)
            .job_name(name)
            .job_function_id(func.id)
            .priority(opts.priority)
            .payload_hash(hash)
            .max_retries(func.max_retries)
            .user_role(caller.role.clone())
            .build();
        job.payload = opts.payload;
        job.scheduled_at = opts.scheduled_at;
        job.created_by = caller.user_id.clone();
        job.user_email = caller.email.clone();

        self.store.insert_job(job).await
    }

    /// Cancel a pending or running job. Never blocks on user code stopping.
    pub async fn cancel(&self, caller: &Caller, job_id: Uuid) -> Result<Job> {
        let job = self.require_job(caller, job_id).await?;

        if job.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {job_id} is already terminal"
            )));
        }

        // Owning worker (if any) sees the broadcast; the row flips either way.
        self.manager.cancel_job(job_id).await;
        self.store
            .cancel_job(job_id, Some("cancelled by operator"))
            .await?;

        self.require_job(caller, job_id).await
    }

    /// Like cancel, but waits for the owning worker to release the job.
    pub async fn terminate(&self, caller: &Caller, job_id: Uuid) -> Result<Job> {
        let job = self.cancel(caller, job_id).await?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.manager.is_job_running(job_id).await && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        Ok(job)
    }

    /// Clone a terminal job into a fresh pending attempt.
    pub async fn retry(&self, caller: &Caller, job_id: Uuid) -> Result<Job> {
        let job = self.require_job(caller, job_id).await?;

        if !job.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {job_id} is not terminal"
            )));
        }

        self.store.insert_job(job.retry_clone()).await
    }

    pub async fn get_job(&self, caller: &Caller, job_id: Uuid) -> Result<Job> {
        self.require_job(caller, job_id).await
    }

    /// List jobs. Non-admin callers only see their own submissions.
    pub async fn list_jobs(&self, caller: &Caller, mut filter: JobFilter) -> Result<Vec<Job>> {
        if !caller.is_admin_tier() {
            let Some(user_id) = caller.user_id.clone() else {
                return Err(EngineError::Authorization(
                    "anonymous callers cannot list jobs".to_string(),
                ));
            };
            filter.created_by = Some(user_id);
        }
        self.store.list_jobs(&filter).await
    }

    pub async fn get_function(&self, namespace: Option<&str>, name: &str) -> Result<JobFunction> {
        let namespace = namespace.unwrap_or(&self.default_namespace);
        self.store
            .get_function_by_name(namespace, name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("function {namespace}/{name}")))
    }

    pub async fn list_functions(&self, namespace: Option<&str>) -> Result<Vec<JobFunction>> {
        self.store.list_functions(namespace).await
    }

    pub async fn stats(&self, namespace: Option<&str>) -> Result<JobStats> {
        self.store.job_stats(namespace).await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        self.store.list_workers().await
    }

    pub async fn get_logs(
        &self,
        caller: &Caller,
        job_id: Uuid,
        after_line: Option<i64>,
    ) -> Result<Vec<ExecutionLog>> {
        self.require_job(caller, job_id).await?;
        self.store.get_logs(job_id, after_line).await
    }

    /// Fetch a job and enforce the ownership gate.
    async fn require_job(&self, caller: &Caller, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;

        if caller.is_admin_tier() || caller.owns(&job) {
            Ok(job)
        } else {
            Err(EngineError::Authorization(format!(
                "caller may not access job {job_id}"
            )))
        }
    }
}

/// Canonical payload hash for the duplicate guard.
///
/// serde_json maps are key-sorted, so equal payloads hash equally regardless
/// of construction order.
pub fn payload_hash(payload: Option<&serde_json::Value>) -> String {
    let bytes = match payload {
        Some(value) => serde_json::to_vec(value).unwrap_or_default(),
        None => b"{}".to_vec(),
    };
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::Runtime;
    use crate::store::JobStatus;
    use crate::testing::{InMemoryJobStore, ScriptedRuntime};
    use crate::token::Hs256TokenSigner;

    async fn setup() -> (Arc<InMemoryJobStore>, JobHandler) {
        let store = Arc::new(InMemoryJobStore::new());
        let config = Arc::new(EngineConfig::default());
        let runtime: Arc<dyn Runtime> = Arc::new(ScriptedRuntime::new());
        let manager = WorkerManager::new(
            store.clone(),
            runtime,
            config.clone(),
            Arc::new(Hs256TokenSigner::new("test")),
        );
        let handler = JobHandler::new(store.clone(), manager, &config);
        (store, handler)
    }

    async fn register(store: &InMemoryJobStore, name: &str, require_roles: Vec<String>) {
        let func = JobFunction::builder()
            .namespace("default")
            .name(name)
            .code("{}")
            .require_roles(require_roles)
            .build();
        store.upsert_function(func).await.unwrap();
    }

    #[tokio::test]
    async fn submit_inserts_pending_job() {
        let (store, handler) = setup().await;
        register(&store, "send-email", vec![]).await;

        let caller = Caller::new("user-1", auth::AUTHENTICATED);
        let opts = SubmitOptions::builder()
            .payload(serde_json::json!({"to": "a@b"}))
            .build();
        let job = handler.submit(&caller, "send-email", opts).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.created_by.as_deref(), Some("user-1"));
        assert!(job.payload_hash.is_some());
    }

    #[tokio::test]
    async fn submit_unknown_function_is_validation() {
        let (_, handler) = setup().await;
        let err = handler
            .submit(&Caller::service(), "nope", SubmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn submit_disabled_function_is_validation() {
        let (store, handler) = setup().await;
        let func = JobFunction::builder()
            .namespace("default")
            .name("off")
            .code("{}")
            .enabled(false)
            .build();
        store.upsert_function(func).await.unwrap();

        let err = handler
            .submit(&Caller::service(), "off", SubmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn submit_enforces_required_roles() {
        let (store, handler) = setup().await;
        register(&store, "admin-only", vec!["admin".to_string()]).await;

        let err = handler
            .submit(
                &Caller::new("u", auth::AUTHENTICATED),
                "admin-only",
                SubmitOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        // No row was created.
        assert!(handler
            .list_jobs(&Caller::service(), JobFilter::default())
            .await
            .unwrap()
            .is_empty());

        // service_role clears the bar.
        let job = handler
            .submit(&Caller::service(), "admin-only", SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn dedupe_rejects_outstanding_twin() {
        let (store, handler) = setup().await;
        register(&store, "import", vec![]).await;

        let caller = Caller::new("user-1", auth::AUTHENTICATED);
        let opts = || {
            SubmitOptions::builder()
                .payload(serde_json::json!({"file": "a.csv"}))
                .dedupe(true)
                .build()
        };

        let first = handler.submit(&caller, "import", opts()).await.unwrap();
        let err = handler.submit(&caller, "import", opts()).await.unwrap_err();

        match err {
            EngineError::Duplicate { existing } => assert_eq!(existing, first.id),
            other => panic!("expected duplicate, got {other}"),
        }

        // A different payload is not a duplicate.
        let opts = SubmitOptions::builder()
            .payload(serde_json::json!({"file": "b.csv"}))
            .dedupe(true)
            .build();
        handler.submit(&caller, "import", opts).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let (store, handler) = setup().await;
        register(&store, "slow", vec![]).await;

        let caller = Caller::new("user-1", auth::AUTHENTICATED);
        let job = handler
            .submit(&caller, "slow", SubmitOptions::default())
            .await
            .unwrap();

        let cancelled = handler.cancel(&caller, job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // Terminal jobs cannot be cancelled again.
        let err = handler.cancel(&caller, job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn retry_clones_terminal_job() {
        let (store, handler) = setup().await;
        register(&store, "flaky", vec![]).await;

        let caller = Caller::new("user-1", auth::AUTHENTICATED);
        let job = handler
            .submit(&caller, "flaky", SubmitOptions::default())
            .await
            .unwrap();

        // Running jobs cannot be retried.
        let err = handler.retry(&caller, job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        store.cancel_job(job.id, None).await.unwrap();
        let retried = handler.retry(&caller, job.id).await.unwrap();
        assert_ne!(retried.id, job.id);
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 0);
    }

    #[tokio::test]
    async fn non_owner_access_requires_admin_tier() {
        let (store, handler) = setup().await;
        register(&store, "job", vec![]).await;

        let owner = Caller::new("user-1", auth::AUTHENTICATED);
        let job = handler
            .submit(&owner, "job", SubmitOptions::default())
            .await
            .unwrap();

        // The owner and admin-tier callers read it; a stranger does not.
        handler.get_job(&owner, job.id).await.unwrap();
        handler.get_job(&Caller::service(), job.id).await.unwrap();

        let stranger = Caller::new("user-2", auth::AUTHENTICATED);
        let err = handler.get_job(&stranger, job.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn list_jobs_scopes_non_admin_to_own_rows() {
        let (store, handler) = setup().await;
        register(&store, "job", vec![]).await;

        let alice = Caller::new("alice", auth::AUTHENTICATED);
        let bob = Caller::new("bob", auth::AUTHENTICATED);
        handler.submit(&alice, "job", SubmitOptions::default()).await.unwrap();
        handler.submit(&bob, "job", SubmitOptions::default()).await.unwrap();

        let seen = handler.list_jobs(&alice, JobFilter::default()).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].created_by.as_deref(), Some("alice"));

        let all = handler
            .list_jobs(&Caller::service(), JobFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let err = handler
            .list_jobs(&Caller::anonymous(), JobFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[test]
    fn payload_hash_is_stable_and_discriminating() {
        let a = payload_hash(Some(&serde_json::json!({"x": 1, "y": 2})));
        let b = payload_hash(Some(&serde_json::json!({"y": 2, "x": 1})));
        let c = payload_hash(Some(&serde_json::json!({"x": 1, "y": 3})));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(payload_hash(None), payload_hash(Some(&serde_json::json!({}))));
    }
}
