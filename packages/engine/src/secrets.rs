//! Secrets interface consumed from the settings service.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Read-only view of the platform's settings/secrets service.
///
/// Injected into workers after construction; when absent, jobs run with an
/// empty secret set.
#[async_trait]
pub trait SettingsSecretsService: Send + Sync {
    /// Secrets owned by a specific user.
    async fn user_secrets(&self, user_id: &str) -> Result<HashMap<String, String>>;

    /// Platform-wide secrets exposed to every job.
    async fn system_secrets(&self) -> Result<HashMap<String, String>>;
}
