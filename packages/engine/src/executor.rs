//! Translation from a stored job + resolved function into a runtime request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runtime::{ExecutionRequest, SandboxPermissions};
use crate::secrets::SettingsSecretsService;
use crate::store::{Job, JobFunction};
use crate::token::{JobClaims, TokenSigner};

/// Build the request a [`crate::runtime::Runtime`] executes for `job`.
pub async fn build_execution_request(
    job: &Job,
    func: &JobFunction,
    config: &EngineConfig,
    secrets_service: Option<&Arc<dyn SettingsSecretsService>>,
    signer: &dyn TokenSigner,
) -> Result<ExecutionRequest> {
    let user_id = job.created_by.clone().unwrap_or_default();
    let user_role = job
        .user_role
        .clone()
        .unwrap_or_else(|| auth::ANON.to_string());

    let timeout_seconds = derive_seconds(
        job.max_duration_seconds,
        func.timeout_seconds,
        config.default_timeout_seconds,
    );
    let progress_timeout_seconds = derive_seconds(
        job.progress_timeout_seconds,
        func.progress_timeout_seconds,
        config.default_progress_timeout_seconds,
    );

    let secrets = load_secrets(secrets_service, &user_id).await?;

    let ttl = timeout_seconds + config.jwt_grace.as_secs() as i64;
    let claims = JobClaims::new(user_id.clone(), user_role.clone(), job.user_email.clone(), ttl);
    let jwt = signer.sign(&claims)?;

    Ok(ExecutionRequest {
        job_id: job.id,
        namespace: job.namespace.clone(),
        job_name: job.job_name.clone(),
        code: func.code.clone(),
        payload: normalize_payload(job.payload.clone()),
        base_url: config.base_url.clone(),
        user_id,
        user_email: job.user_email.clone(),
        user_role,
        jwt,
        secrets,
        timeout: Duration::from_secs(timeout_seconds as u64),
        progress_timeout: Duration::from_secs(progress_timeout_seconds as u64),
        memory_limit_mb: func.memory_limit_mb,
        permissions: SandboxPermissions {
            allow_net: func.allow_net,
            allow_env: func.allow_env,
            allow_read: func.allow_read,
            allow_write: func.allow_write,
        },
    })
}

/// Job-level override → function-level → engine default.
fn derive_seconds(job_override: Option<i64>, func_value: i64, default: i64) -> i64 {
    match job_override {
        Some(v) if v > 0 => v,
        _ if func_value > 0 => func_value,
        _ => default,
    }
}

/// The child sees structured input or nothing; a payload that is not valid
/// structured data degrades to an empty input rather than failing the run.
fn normalize_payload(payload: Option<serde_json::Value>) -> Option<serde_json::Value> {
    match payload {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(raw)) => serde_json::from_str(&raw).ok(),
        Some(other) => Some(other),
    }
}

/// Merge system and per-user secrets; user values win on key collisions.
async fn load_secrets(
    service: Option<&Arc<dyn SettingsSecretsService>>,
    user_id: &str,
) -> Result<HashMap<String, String>> {
    let Some(service) = service else {
        return Ok(HashMap::new());
    };

    let mut merged = HashMap::new();

    let system = service
        .system_secrets()
        .await
        .map_err(|e| EngineError::Storage(format!("loading system secrets: {e}")))?;
    for (key, value) in system {
        merged.insert(normalize_secret_key(&key), value);
    }

    if !user_id.is_empty() {
        let user = service
            .user_secrets(user_id)
            .await
            .map_err(|e| EngineError::Storage(format!("loading user secrets: {e}")))?;
        for (key, value) in user {
            merged.insert(normalize_secret_key(&key), value);
        }
    }

    Ok(merged)
}

/// `mail.api.key` → `MAIL_API_KEY`.
fn normalize_secret_key(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}

#[cfg(test)]
mod tests {
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;

    use super::*;
    use crate::token::Hs256TokenSigner;

    struct StaticSecrets;

    #[async_trait]
    impl SettingsSecretsService for StaticSecrets {
        async fn user_secrets(&self, _user_id: &str) -> AnyResult<HashMap<String, String>> {
            Ok(HashMap::from([
                ("mail.api.key".to_string(), "user-key".to_string()),
                ("user.only".to_string(), "u".to_string()),
            ]))
        }

        async fn system_secrets(&self) -> AnyResult<HashMap<String, String>> {
            Ok(HashMap::from([
                ("mail.api.key".to_string(), "system-key".to_string()),
                ("system.only".to_string(), "s".to_string()),
            ]))
        }
    }

    fn sample_job() -> Job {
        Job::builder()
            .namespace("default")
            .job_name("send-email")
            .payload(serde_json::json!({"to": "a@b"}))
            .created_by("user-1")
            .user_role("authenticated")
            .build()
    }

    fn sample_function() -> JobFunction {
        JobFunction::builder()
            .namespace("default")
            .name("send-email")
            .code("{}")
            .build()
    }

    #[test]
    fn payload_normalization() {
        assert_eq!(normalize_payload(None), None);
        assert_eq!(normalize_payload(Some(serde_json::Value::Null)), None);
        assert_eq!(
            normalize_payload(Some(serde_json::json!({"a": 1}))),
            Some(serde_json::json!({"a": 1}))
        );
        // Encoded JSON strings are unwrapped, garbage degrades to empty input.
        assert_eq!(
            normalize_payload(Some(serde_json::json!("{\"a\":1}"))),
            Some(serde_json::json!({"a": 1}))
        );
        assert_eq!(normalize_payload(Some(serde_json::json!("not json"))), None);
    }

    #[test]
    fn timeout_derivation_prefers_job_then_function() {
        assert_eq!(derive_seconds(Some(10), 120, 300), 10);
        assert_eq!(derive_seconds(None, 120, 300), 120);
        assert_eq!(derive_seconds(Some(0), 120, 300), 120);
        assert_eq!(derive_seconds(None, 0, 300), 300);
    }

    #[test]
    fn secret_keys_are_normalized() {
        assert_eq!(normalize_secret_key("mail.api.key"), "MAIL_API_KEY");
        assert_eq!(normalize_secret_key("PLAIN"), "PLAIN");
    }

    #[tokio::test]
    async fn request_carries_identity_budgets_and_merged_secrets() {
        let job = sample_job();
        let func = sample_function();
        let config = EngineConfig::default();
        let signer = Hs256TokenSigner::new("test-secret");
        let secrets: Arc<dyn SettingsSecretsService> = Arc::new(StaticSecrets);

        let request = build_execution_request(&job, &func, &config, Some(&secrets), &signer)
            .await
            .unwrap();

        assert_eq!(request.user_id, "user-1");
        assert_eq!(request.user_role, "authenticated");
        assert_eq!(request.timeout, Duration::from_secs(300));
        assert_eq!(request.memory_limit_mb, 256);
        assert!(!request.jwt.is_empty());

        // User secrets win collisions; both sides are present.
        assert_eq!(request.secrets["MAIL_API_KEY"], "user-key");
        assert_eq!(request.secrets["SYSTEM_ONLY"], "s");
        assert_eq!(request.secrets["USER_ONLY"], "u");
    }

    #[tokio::test]
    async fn anonymous_jobs_skip_user_secrets() {
        let mut job = sample_job();
        job.created_by = None;
        job.user_role = None;
        let func = sample_function();
        let config = EngineConfig::default();
        let signer = Hs256TokenSigner::new("test-secret");
        let secrets: Arc<dyn SettingsSecretsService> = Arc::new(StaticSecrets);

        let request = build_execution_request(&job, &func, &config, Some(&secrets), &signer)
            .await
            .unwrap();

        assert_eq!(request.user_id, "");
        assert_eq!(request.user_role, "anon");
        assert!(!request.secrets.contains_key("USER_ONLY"));
        assert_eq!(request.secrets["MAIL_API_KEY"], "system-key");
    }
}
