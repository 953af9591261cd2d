//! Fixed on-disk layout of one run: `base_dir/<experiment>/<run>/`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, RuntrackError};
use crate::models::{ExperimentMetadata, RunConfig};

pub const CONFIG_FILE: &str = "config.yaml";
pub const METRICS_DATASET: &str = "metrics.parquet";
pub const RUN_LOG_FILE: &str = "run.log";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const EXPERIMENT_FILE: &str = "experiment.yaml";

/// Paths for one run. Created eagerly by [`RunDirectory::create`], never
/// deleted by the engine.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// Wrap an existing run directory, e.g. for read-only access.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the run directory tree for `config`, plus the experiment
    /// metadata file if this is the experiment's first run.
    pub fn create(config: &RunConfig) -> Result<Self> {
        let dir = Self::at(config.run_dir());
        for path in [dir.root.clone(), dir.artifacts_dir(), dir.metrics_dir()] {
            create_dir(&path)?;
        }

        let exp_meta_path = config.experiment_dir().join(EXPERIMENT_FILE);
        if let Err(e) = write_experiment_metadata(&exp_meta_path) {
            warn!(path = %exp_meta_path.display(), error = %e, "could not write experiment metadata");
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Directory holding one Parquet segment per flush.
    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join(METRICS_DATASET)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(RUN_LOG_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| RuntrackError::DirectoryCreate {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the default experiment document unless some run already did.
/// Concurrent openers race on `create_new`; exactly one of them writes.
fn write_experiment_metadata(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let content = serde_yaml::to_string(&ExperimentMetadata::default())?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
