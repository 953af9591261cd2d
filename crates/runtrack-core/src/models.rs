//! Data models for runtrack.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntrackError};

/// A single hyperparameter value as persisted in `config.yaml`.
pub type ParamValue = serde_yaml::Value;

/// Bounded retry schedule for flush and config writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on every retry.
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    const MAX_BACKOFF_MS: u64 = 1_000;

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(Self::MAX_BACKOFF_MS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 25,
        }
    }
}

/// Configuration for a single experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of the experiment (e.g. "resnet_cifar10")
    pub name: String,
    /// Name of this specific run (auto-generated by `new`)
    pub run_name: String,
    /// Root directory for all experiments
    pub base_dir: PathBuf,
    /// Flush metrics to disk every N rows (default: 50)
    pub flush_interval_rows: usize,
    /// Flush metrics to disk every N milliseconds (default: 500)
    pub flush_interval_ms: u64,
    /// Language used for the run (e.g. "rust", "python")
    pub language: String,
    /// Environment path or executable (e.g. python executable path)
    pub env_path: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Artifact copies proceed in chunks of this many bytes
    #[serde(default = "default_copy_chunk_bytes")]
    pub copy_chunk_bytes: usize,
}

fn default_copy_chunk_bytes() -> usize {
    1 << 20
}

impl RunConfig {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            run_name: generate_run_name(),
            base_dir: base_dir.into(),
            flush_interval_rows: 50,
            flush_interval_ms: 500,
            language: "rust".to_string(),
            env_path: None,
            retry: RetryPolicy::default(),
            copy_chunk_bytes: default_copy_chunk_bytes(),
        }
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = run_name.into();
        self
    }

    pub fn with_flush_interval_rows(mut self, rows: usize) -> Self {
        self.flush_interval_rows = rows;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_env_path(mut self, env_path: impl Into<String>) -> Self {
        self.env_path = Some(env_path.into());
        self
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base_dir.join(&self.name).join(&self.run_name)
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.base_dir.join(&self.name)
    }

    /// Reject configurations the writer cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !is_single_component(&self.name) {
            return Err(RuntrackError::InvalidInput(format!(
                "experiment name must be a single path component, got {:?}",
                self.name
            )));
        }
        if !is_single_component(&self.run_name) {
            return Err(RuntrackError::InvalidInput(format!(
                "run name must be a single path component, got {:?}",
                self.run_name
            )));
        }
        if self.flush_interval_rows == 0 {
            return Err(RuntrackError::InvalidInput(
                "flush_interval_rows must be at least 1".into(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(RuntrackError::InvalidInput(
                "flush_interval_ms must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RuntrackError::InvalidInput(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.copy_chunk_bytes == 0 {
            return Err(RuntrackError::InvalidInput(
                "copy_chunk_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn is_single_component(s: &str) -> bool {
    let mut components = Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Timestamp plus a random suffix, so two runs started within the same
/// second still get distinct directories.
pub fn generate_run_name() -> String {
    let now = chrono::Local::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Severity of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
        }
    }
}

/// One persisted metric row, as read back from the column store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub step: i64,
    pub wall_time: DateTime<Utc>,
}

/// Status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Metadata stored alongside a run, finalized at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub name: String,
    pub experiment: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Rows committed to the column store.
    #[serde(default)]
    pub total_rows: u64,
    /// Rows abandoned after a flush exhausted its retries.
    #[serde(default)]
    pub dropped_rows: u64,
    #[serde(default)]
    pub flushes: u64,
    pub flush_interval_rows: usize,
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub env_path: Option<String>,
    /// Latest value per metric name among committed rows.
    #[serde(default)]
    pub last_metrics: BTreeMap<String, f64>,
}

impl RunMetadata {
    pub fn started(config: &RunConfig) -> Self {
        Self {
            name: config.run_name.clone(),
            experiment: config.name.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            total_rows: 0,
            dropped_rows: 0,
            flushes: 0,
            flush_interval_rows: config.flush_interval_rows,
            flush_interval_ms: config.flush_interval_ms,
            language: Some(config.language.clone()),
            env_path: config.env_path.clone(),
            last_metrics: BTreeMap::new(),
        }
    }
}

/// The single structured document persisted as `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    pub run: RunMetadata,
}

/// Metadata stored for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExperimentMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_run_names_are_unique_within_a_second() {
        let a = generate_run_name();
        let b = generate_run_name();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20240101_120000_".len() + 8);
    }

    #[test]
    fn validate_rejects_nested_run_name() {
        let cfg = RunConfig::new("exp", "/tmp").with_run_name("../escape");
        assert!(matches!(cfg.validate(), Err(RuntrackError::InvalidInput(_))));
        let cfg = RunConfig::new("exp", "/tmp").with_run_name("a/b");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let cfg = RunConfig::new("exp", "/tmp").with_flush_interval_rows(0);
        assert!(cfg.validate().is_err());
        let cfg = RunConfig::new("exp", "/tmp").with_flush_interval_ms(0);
        assert!(cfg.validate().is_err());
        assert!(RunConfig::new("exp", "/tmp").validate().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn status_serializes_uppercase() {
        let yaml = serde_yaml::to_string(&RunStatus::Finished).unwrap();
        assert_eq!(yaml.trim(), "FINISHED");
    }
}
