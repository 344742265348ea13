//! Execution contract between the engine and a child runtime.
//!
//! The engine never talks to a sandbox directly; a [`Runtime`] implementation
//! launches one child process per job, streams its events back, and converts
//! cancellation into an OS-level kill. The concrete driver (Deno subprocess,
//! container, test double) is wired in by the embedding host.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::LogLevel;

/// Permission flags the sandbox must enforce on the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SandboxPermissions {
    pub allow_net: bool,
    pub allow_env: bool,
    pub allow_read: bool,
    pub allow_write: bool,
}

/// Everything a child needs to run one job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub namespace: String,
    pub job_name: String,
    /// Bundled artifact produced by the loader.
    pub code: String,
    pub payload: Option<serde_json::Value>,
    /// Base URL for the in-job SDK.
    pub base_url: String,
    /// Empty when the submitter was anonymous.
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_role: String,
    /// Short-lived token covering the execution window.
    pub jwt: String,
    /// Merged user + system secrets under normalized keys.
    pub secrets: HashMap<String, String>,
    pub timeout: Duration,
    pub progress_timeout: Duration,
    pub memory_limit_mb: i64,
    pub permissions: SandboxPermissions,
}

/// Typed event stream from the child.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Log { level: LogLevel, message: String },
    Progress(serde_json::Value),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("no progress or log output for {0:?}")]
    ProgressTimeout(Duration),
    #[error("execution cancelled")]
    Cancelled,
    #[error("child crashed: {0}")]
    ChildCrash(String),
    #[error("runtime setup failed: {0}")]
    Setup(String),
}

/// Pluggable sandbox driver.
///
/// Implementations must kill the child when `cancel` fires, when wall-clock
/// exceeds `request.timeout`, or when event silence exceeds
/// `request.progress_timeout`, and must hold the child under
/// `request.memory_limit_mb` with `request.permissions` applied.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn execute(
        &self,
        cancel: CancellationToken,
        request: ExecutionRequest,
        events: mpsc::Sender<RuntimeEvent>,
    ) -> Result<serde_json::Value, RuntimeError>;
}
