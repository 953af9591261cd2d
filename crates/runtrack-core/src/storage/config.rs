//! `config.yaml`: merged parameters plus run metadata, one document per run.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::ConfigDocument;
use crate::storage::save_yaml;

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the document atomically.
    pub fn write(&self, doc: &ConfigDocument) -> Result<()> {
        save_yaml(&self.path, doc)
    }

    pub fn load(&self) -> Result<ConfigDocument> {
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}
