//! `@fluxbase:` annotation scanning.
//!
//! Job sources declare execution metadata in comments:
//!
//! ```text
//! // @fluxbase:timeout 120
//! // @fluxbase:schedule */5 * * * *
//! // @fluxbase:require-role admin,reporting
//! ```
//!
//! The scanner is tolerant: unknown keys are ignored and malformed values
//! fall back to the engine defaults.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ANNOTATION_RE: Regex =
        Regex::new(r"@fluxbase:([a-z][a-z-]*)[ \t]+(.+)").expect("annotation regex");
}

/// Parsed execution metadata with engine defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionAnnotations {
    pub timeout_seconds: i64,
    pub progress_timeout_seconds: i64,
    pub max_retries: i32,
    pub memory_limit_mb: i64,
    pub allow_net: bool,
    pub allow_env: bool,
    pub allow_read: bool,
    pub allow_write: bool,
    pub enabled: bool,
    pub schedule: Option<String>,
    pub schedule_params: Option<serde_json::Value>,
    pub require_roles: Vec<String>,
}

impl Default for FunctionAnnotations {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            progress_timeout_seconds: 300,
            max_retries: 0,
            memory_limit_mb: 256,
            allow_net: true,
            allow_env: true,
            allow_read: false,
            allow_write: false,
            enabled: true,
            schedule: None,
            schedule_params: None,
            require_roles: Vec::new(),
        }
    }
}

impl FunctionAnnotations {
    /// Scan a source file linearly for annotations inside comments.
    pub fn parse(source: &str) -> Self {
        let mut out = Self::default();
        let mut in_block = false;

        for raw in source.lines() {
            let line = raw.trim();

            let comment_text = if in_block {
                if line.contains("*/") {
                    in_block = false;
                }
                Some(line)
            } else if let Some(idx) = line.find("/*") {
                if !line[idx..].contains("*/") {
                    in_block = true;
                }
                Some(&line[idx..])
            } else {
                line.find("//").map(|idx| &line[idx..])
            };

            let Some(text) = comment_text else { continue };
            let Some(caps) = ANNOTATION_RE.captures(text) else {
                continue;
            };

            let key = &caps[1];
            let value = caps[2].trim().trim_end_matches("*/").trim();
            out.apply(key, value);
        }

        out
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "timeout" => self.timeout_seconds = parse_or(value, self.timeout_seconds),
            "progress-timeout" => {
                self.progress_timeout_seconds = parse_or(value, self.progress_timeout_seconds)
            }
            "max-retries" => self.max_retries = parse_or(value, self.max_retries),
            "memory" => self.memory_limit_mb = parse_or(value, self.memory_limit_mb),
            "allow-net" => self.allow_net = parse_bool_or(value, self.allow_net),
            "allow-env" => self.allow_env = parse_bool_or(value, self.allow_env),
            "allow-read" => self.allow_read = parse_bool_or(value, self.allow_read),
            "allow-write" => self.allow_write = parse_bool_or(value, self.allow_write),
            "enabled" => self.enabled = parse_bool_or(value, self.enabled),
            "schedule" => self.schedule = Some(value.to_string()),
            "schedule-params" => {
                self.schedule_params = serde_json::from_str(value).ok();
            }
            "require-role" => {
                self.require_roles = value
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect();
            }
            // Unknown keys are ignored.
            _ => {}
        }
    }

    /// Persistence encoding of the cron binding: `<cron>|<json>`.
    ///
    /// Params without a schedule have nothing to fire them and fold to none.
    pub fn fold_schedule(&self) -> Option<String> {
        match (&self.schedule, &self.schedule_params) {
            (Some(cron), Some(params)) => Some(format!("{cron}|{params}")),
            (Some(cron), None) => Some(cron.clone()),
            (None, _) => None,
        }
    }
}

/// Split a folded `<cron>|<json>` value back into its parts.
pub fn split_schedule(folded: &str) -> (String, Option<serde_json::Value>) {
    match folded.split_once('|') {
        Some((cron, params)) => (cron.trim().to_string(), serde_json::from_str(params).ok()),
        None => (folded.trim().to_string(), None),
    }
}

fn parse_or<T: std::str::FromStr>(value: &str, default: T) -> T {
    value.parse().unwrap_or(default)
}

fn parse_bool_or(value: &str, default: bool) -> bool {
    match value {
        "true" => true,
        "false" => false,
        _ => default,
    }
}
