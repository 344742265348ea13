//! Engine error types.
//!
//! Every failure the engine surfaces carries a machine-readable kind tag in
//! addition to the human-readable message. Terminal job transitions persist
//! the same tags so API consumers and the retry logic agree on semantics.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Machine-readable error classification.
///
/// Stored on failed jobs and returned by API operations. `should_retry`
/// drives the re-enqueue decision in `JobStore::fail_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission, unknown/disabled function, bad cron expression
    Validation,
    /// Caller role does not satisfy the function's requirements
    Authorization,
    /// Duplicate-job guard tripped
    Duplicate,
    /// Job or function id absent
    NotFound,
    /// Wall-clock or progress-silence breach
    Timeout,
    /// Runtime reported a non-zero exit without a result
    ChildCrash,
    /// Cancelled by an operator
    Cancelled,
    /// Interrupted by shutdown or a dead worker
    Interrupted,
    /// Database failure after internal retries were exhausted
    Storage,
}

impl ErrorKind {
    /// Wire tag used in API responses and the `error_kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ChildCrash => "child-crash",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Storage => "storage",
        }
    }

    /// Whether a failure of this kind is eligible for re-enqueue.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ChildCrash | ErrorKind::Interrupted | ErrorKind::Storage
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedule that fires more often than the engine allows.
///
/// Registration computes the gap between the next two fires; anything under
/// one minute is rejected before the entry reaches the cron engine.
#[derive(Debug, Clone, Error)]
#[error(
    "cron schedule {expression:?} fires every {}, below the minimum interval of {}",
    format_interval(.interval),
    format_interval(.minimum)
)]
pub struct CronIntervalError {
    pub expression: String,
    pub interval: Duration,
    pub minimum: Duration,
}

/// Render a duration the way operators read schedules: `30s`, `1m0s`, `2h5m0s`.
pub(crate) fn format_interval(d: &Duration) -> String {
    let total = d.as_secs();
    let (hours, rem) = (total / 3600, total % 3600);
    let (mins, secs) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours}h{mins}m{secs}s")
    } else if mins > 0 {
        format!("{mins}m{secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error(transparent)]
    CronInterval(#[from] CronIntervalError),

    #[error("authorization: {0}")]
    Authorization(String),

    #[error("duplicate job: an outstanding job with the same payload exists ({existing})")]
    Duplicate { existing: Uuid },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("execution timed out after {}", format_interval(.0))]
    Timeout(Duration),

    #[error("no progress for {}", format_interval(.0))]
    ProgressTimeout(Duration),

    #[error("child runtime crashed: {0}")]
    ChildCrash(String),

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::CronInterval(_) => ErrorKind::Validation,
            EngineError::Authorization(_) => ErrorKind::Authorization,
            EngineError::Duplicate { .. } => ErrorKind::Duplicate,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Timeout(_) | EngineError::ProgressTimeout(_) => ErrorKind::Timeout,
            EngineError::ChildCrash(_) => ErrorKind::ChildCrash,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Interrupted(_) => ErrorKind::Interrupted,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.kind().should_retry()
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".to_string()),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
