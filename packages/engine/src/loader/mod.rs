//! Annotation-driven job-function loader.
//!
//! Translates a jobs-root directory tree (or an API payload) into registered
//! [`JobFunction`] rows:
//!
//! ```text
//! <jobs_root>/
//!   _shared/**          library folder, bundled into every job as _shared/…
//!   send-email.ts       single-file job
//!   sync-users/
//!     index.ts          required entry
//!     lib/helpers.ts    supporting files, any depth
//!     deno.json         included verbatim
//! ```

mod annotations;
mod bundle;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::store::{FunctionSource, JobFunction, JobStore};

pub use annotations::{split_schedule, FunctionAnnotations};
pub use bundle::Bundle;

const SOURCE_EXTENSIONS: [&str; 4] = ["ts", "js", "mjs", "mts"];
const SHARED_DIR: &str = "_shared";

/// What a directory scan produced.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<JobFunction>,
    /// `(name, reason)` for entries that did not register.
    pub skipped: Vec<(String, String)>,
}

/// Reads job sources, bundles them, and registers functions in the store.
pub struct FunctionLoader {
    store: Arc<dyn JobStore>,
    namespace: String,
}

impl FunctionLoader {
    pub fn new(store: Arc<dyn JobStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Scan `root` and register every job found under it.
    ///
    /// Entries that violate the directory contract are skipped with a warning
    /// and reported; the rest of the tree still loads.
    pub async fn load_directory(&self, root: &Path) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        if !root.is_dir() {
            return Err(EngineError::Validation(format!(
                "jobs root {} is not a directory",
                root.display()
            )));
        }

        let shared = collect_shared(root)?;

        let mut entries: Vec<_> = std::fs::read_dir(root)
            .map_err(|e| EngineError::Validation(format!("reading jobs root: {e}")))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().to_string();

            if file_name.starts_with('.') || file_name == SHARED_DIR {
                continue;
            }

            let job = if path.is_dir() {
                self.load_job_directory(&path, &file_name, &shared)
            } else if has_source_extension(&path) {
                self.load_single_file(&path, &shared)
            } else {
                continue;
            };

            match job {
                Ok(func) => {
                    let registered = self.store.upsert_function(func).await?;
                    info!(
                        namespace = %registered.namespace,
                        name = %registered.name,
                        version = registered.version,
                        "registered job function"
                    );
                    report.loaded.push(registered);
                }
                Err(e) => {
                    warn!(name = %file_name, error = %e, "skipping job");
                    report.skipped.push((file_name, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Register a function from an API payload with pre-bundled code.
    ///
    /// `folded_schedule` uses the `<cron>|<json>` encoding the annotation
    /// parser produces.
    pub async fn register_api_function(
        &self,
        name: &str,
        code: String,
        annotations: FunctionAnnotations,
        folded_schedule: Option<&str>,
    ) -> Result<JobFunction> {
        let (schedule, schedule_params) = match folded_schedule {
            Some(folded) => {
                let (cron, params) = split_schedule(folded);
                (Some(cron), params)
            }
            None => (annotations.schedule.clone(), annotations.schedule_params.clone()),
        };

        let func = self.build_function(name, code, &annotations, schedule, schedule_params);
        let func = JobFunction {
            source: FunctionSource::Api,
            ..func
        };

        self.store.upsert_function(func).await
    }

    fn load_single_file(&self, path: &Path, shared: &[(String, String)]) -> Result<JobFunction> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| EngineError::Validation("unreadable file name".to_string()))?
            .to_string();
        let entry_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| EngineError::Validation("unreadable file name".to_string()))?
            .to_string();

        let source = read_source(path)?;
        let annotations = FunctionAnnotations::parse(&source);

        let mut bundle = Bundle::new(&entry_name);
        bundle.add_file(entry_name, source);
        add_shared(&mut bundle, shared);

        self.finish(name, bundle, annotations)
    }

    fn load_job_directory(
        &self,
        dir: &Path,
        name: &str,
        shared: &[(String, String)],
    ) -> Result<JobFunction> {
        let entry_name = SOURCE_EXTENSIONS
            .iter()
            .map(|ext| format!("index.{ext}"))
            .find(|candidate| dir.join(candidate).is_file())
            .ok_or_else(|| {
                EngineError::Validation(format!("job directory {name} has no index entry"))
            })?;

        let entry_source = read_source(&dir.join(&entry_name))?;
        let annotations = FunctionAnnotations::parse(&entry_source);

        let mut bundle = Bundle::new(&entry_name);
        for item in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !item.file_type().is_file() {
                continue;
            }
            let rel = item
                .path()
                .strip_prefix(dir)
                .map_err(|e| EngineError::Validation(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            bundle.add_file(rel, read_source(item.path())?);
        }
        add_shared(&mut bundle, shared);

        self.finish(name.to_string(), bundle, annotations)
    }

    fn finish(
        &self,
        name: String,
        bundle: Bundle,
        annotations: FunctionAnnotations,
    ) -> Result<JobFunction> {
        let code = bundle.to_artifact()?;
        let schedule = annotations.schedule.clone();
        let schedule_params = annotations.schedule_params.clone();
        Ok(self.build_function(&name, code, &annotations, schedule, schedule_params))
    }

    fn build_function(
        &self,
        name: &str,
        code: String,
        ann: &FunctionAnnotations,
        schedule: Option<String>,
        schedule_params: Option<serde_json::Value>,
    ) -> JobFunction {
        let mut func = JobFunction::builder()
            .namespace(self.namespace.clone())
            .name(name)
            .code(code)
            .enabled(ann.enabled)
            .timeout_seconds(ann.timeout_seconds)
            .progress_timeout_seconds(ann.progress_timeout_seconds)
            .memory_limit_mb(ann.memory_limit_mb)
            .max_retries(ann.max_retries)
            .allow_net(ann.allow_net)
            .allow_env(ann.allow_env)
            .allow_read(ann.allow_read)
            .allow_write(ann.allow_write)
            .require_roles(ann.require_roles.clone())
            .build();
        func.schedule = schedule;
        func.schedule_params = schedule_params;
        func
    }
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| EngineError::Validation(format!("reading {}: {e}", path.display())))
}

/// Library files bundled into every job under the `_shared/` prefix.
fn collect_shared(root: &Path) -> Result<Vec<(String, String)>> {
    let shared_root = root.join(SHARED_DIR);
    if !shared_root.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for item in WalkDir::new(&shared_root).into_iter().filter_map(|e| e.ok()) {
        if !item.file_type().is_file() {
            continue;
        }
        let rel = item
            .path()
            .strip_prefix(&shared_root)
            .map_err(|e| EngineError::Validation(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        files.push((format!("{SHARED_DIR}/{rel}"), read_source(item.path())?));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn add_shared(bundle: &mut Bundle, shared: &[(String, String)]) {
    for (path, source) in shared {
        bundle.add_file(path.clone(), source.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::testing::InMemoryJobStore;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    async fn load(root: &Path) -> (LoadReport, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let loader = FunctionLoader::new(store.clone(), "default");
        let report = loader.load_directory(root).await.unwrap();
        (report, store)
    }

    #[tokio::test]
    async fn loads_single_file_job() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("send-email.ts"),
            "// @fluxbase:timeout 60\nexport default async () => ({ ok: true });",
        );

        let (report, _) = load(dir.path()).await;
        assert_eq!(report.loaded.len(), 1);
        let func = &report.loaded[0];
        assert_eq!(func.name, "send-email");
        assert_eq!(func.timeout_seconds, 60);
        assert!(func.is_bundled);

        let bundle = Bundle::from_artifact(&func.code).unwrap();
        assert_eq!(bundle.entry, "send-email.ts");
        assert!(bundle.files.contains_key("send-email.ts"));
    }

    #[tokio::test]
    async fn loads_directory_job_with_supporting_files() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sync-users/index.ts"),
            "import './lib/page.ts';\nexport default async () => ({});",
        );
        write(&dir.path().join("sync-users/lib/page.ts"), "export {};");
        write(&dir.path().join("sync-users/deno.json"), "{}");

        let (report, _) = load(dir.path()).await;
        assert_eq!(report.loaded.len(), 1);

        let bundle = Bundle::from_artifact(&report.loaded[0].code).unwrap();
        assert_eq!(bundle.entry, "index.ts");
        assert!(bundle.files.contains_key("lib/page.ts"));
        assert!(bundle.files.contains_key("deno.json"));
    }

    #[tokio::test]
    async fn shared_library_is_bundled_into_every_job() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("_shared/mail.ts"), "export const send = 1;");
        write(&dir.path().join("a.ts"), "export default async () => ({});");
        write(
            &dir.path().join("b/index.ts"),
            "export default async () => ({});",
        );

        let (report, _) = load(dir.path()).await;
        assert_eq!(report.loaded.len(), 2);
        for func in &report.loaded {
            let bundle = Bundle::from_artifact(&func.code).unwrap();
            assert!(
                bundle.files.contains_key("_shared/mail.ts"),
                "{} missing shared file",
                func.name
            );
        }
    }

    #[tokio::test]
    async fn directory_without_index_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("broken/helper.ts"), "export {};");
        write(&dir.path().join("ok.ts"), "export default async () => ({});");

        let (report, _) = load(dir.path()).await;
        assert_eq!(report.loaded.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "broken");
        assert!(report.skipped[0].1.contains("no index entry"));
    }

    #[tokio::test]
    async fn reload_bumps_function_version() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("job.ts"), "export default async () => 1;");

        let store = Arc::new(InMemoryJobStore::new());
        let loader = FunctionLoader::new(store.clone(), "default");
        loader.load_directory(dir.path()).await.unwrap();

        write(&dir.path().join("job.ts"), "export default async () => 2;");
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.loaded[0].version, 2);
    }

    #[tokio::test]
    async fn api_registration_splits_folded_schedule() {
        let store = Arc::new(InMemoryJobStore::new());
        let loader = FunctionLoader::new(store.clone(), "default");

        let func = loader
            .register_api_function(
                "report",
                "{\"entry\":\"index.ts\",\"files\":{}}".to_string(),
                FunctionAnnotations::default(),
                Some("*/10 * * * *|{\"window\":\"1h\"}"),
            )
            .await
            .unwrap();

        assert_eq!(func.source, crate::store::FunctionSource::Api);
        assert_eq!(func.schedule.as_deref(), Some("*/10 * * * *"));
        assert_eq!(func.schedule_params, Some(serde_json::json!({"window": "1h"})));
    }

    #[tokio::test]
    async fn schedule_annotations_reach_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("nightly.ts"),
            "// @fluxbase:schedule */5 * * * *\n// @fluxbase:schedule-params {\"batch\":10}\nexport default async () => ({});",
        );

        let (report, _) = load(dir.path()).await;
        let func = &report.loaded[0];
        assert_eq!(func.schedule.as_deref(), Some("*/5 * * * *"));
        assert_eq!(func.schedule_params, Some(serde_json::json!({"batch": 10})));
    }
}
