//! Distributed background-job engine.
//!
//! Accepts submitted jobs, persists them in PostgreSQL, and executes them
//! across a pool of workers driving sandboxed child runtimes. Survives worker
//! crashes, honors cooperative cancellation, enforces time and resource
//! budgets, fires cron schedules exactly once across a fleet, and streams
//! progress and log observability.
//!
//! # Architecture
//!
//! ```text
//! submit ──► JobHandler ──► JobStore (pending)
//!                               │
//!            Worker poll ◄──────┘ claim (FOR UPDATE SKIP LOCKED)
//!                │
//!                ├─► Runtime.execute (child sandbox)
//!                │       ├─► progress/log events ──► JobStore
//!                │       └─► result / error
//!                └─► JobStore terminal transition
//!
//! CronScheduler ──► advisory fire gate ──► JobStore (pending)
//! WorkerManager ──► supervises Workers, restarts with backoff, reaps dead
//! FunctionLoader ──► @fluxbase: annotations ──► JobFunction registry
//! ```
//!
//! The engine is a library: the embedding host constructs the store, wires a
//! concrete [`runtime::Runtime`], starts the [`manager::WorkerManager`] and
//! [`scheduler::CronScheduler`], and tears both down on shutdown.

pub mod auth;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod loader;
pub mod manager;
pub mod runtime;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod testing;
pub mod token;
pub mod worker;

pub use config::EngineConfig;
pub use error::{CronIntervalError, EngineError, ErrorKind};
pub use handler::{Caller, JobHandler, SubmitOptions};
pub use loader::FunctionLoader;
pub use manager::WorkerManager;
pub use runtime::{ExecutionRequest, Runtime, RuntimeError, RuntimeEvent, SandboxPermissions};
pub use scheduler::CronScheduler;
pub use secrets::SettingsSecretsService;
pub use store::{
    Job, JobFilter, JobFunction, JobStats, JobStatus, JobStore, LogLevel, PostgresJobStore,
};
pub use token::{Hs256TokenSigner, JobClaims, TokenSigner};
pub use worker::Worker;
