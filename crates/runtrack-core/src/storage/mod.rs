//! Storage layer: Parquet metric segments, YAML config, artifact copies,
//! and the plain-text run log.
//!
//! Every file that a live reader may open is published by rename, so a
//! reader sees either the previous complete version or the new one.

pub mod artifacts;
pub mod columns;
pub mod config;
pub mod run_log;

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::layout::RunDirectory;
use crate::models::{ConfigDocument, MetricRecord};

pub use artifacts::{ArtifactCopier, CopyProgress};
pub use columns::{metrics_schema, ColumnStore, MetricRow};
pub use config::ConfigStore;
pub use run_log::RunLog;

// ─── Atomic file helpers ─────────────────────────────────────────────────────

/// Sibling path used while a file is being written: `<name><suffix>`.
pub(crate) fn staging_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write `bytes` to a temporary sibling, sync it, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = staging_path(path, ".tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// ─── YAML I/O ────────────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    write_atomic(path, content.as_bytes())
}

pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T>
where
    T: Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

// ─── Read side ───────────────────────────────────────────────────────────────

/// All committed metric rows of a run, in flush order.
pub fn read_metrics(run_dir: &Path) -> Result<Vec<MetricRecord>> {
    columns::read_dataset(&RunDirectory::at(run_dir).metrics_dir())
}

/// Committed row count, taken from segment footers only.
pub fn count_metric_rows(run_dir: &Path) -> Result<u64> {
    columns::count_dataset_rows(&RunDirectory::at(run_dir).metrics_dir())
}

pub fn load_config(run_dir: &Path) -> Result<ConfigDocument> {
    ConfigStore::new(RunDirectory::at(run_dir).config_path()).load()
}

pub fn read_run_log(run_dir: &Path) -> Result<Vec<String>> {
    run_log::read_lines(&RunDirectory::at(run_dir).log_path())
}
