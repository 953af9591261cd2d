//! Error types for runtrack-core.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntrackError {
    #[error("failed to create run directory {}: {source}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run is closed: the background writer no longer accepts events")]
    ChannelClosed,

    #[error("no active run: call init() first")]
    NoActiveRun,

    #[error("failed to flush metrics: {0}")]
    MetricFlush(String),

    #[error("failed to write config: {0}")]
    ConfigWrite(String),

    #[error("failed to copy artifact {} -> {}: {reason}", src.display(), dest.display())]
    ArtifactCopy {
        src: PathBuf,
        dest: PathBuf,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("background runtime error: {0}")]
    Runtime(String),
}

impl RuntrackError {
    /// True for recoverable I/O-class failures that the writer retries
    /// and records in the run status instead of surfacing to producers.
    pub fn is_io_class(&self) -> bool {
        matches!(
            self,
            RuntrackError::MetricFlush(_)
                | RuntrackError::ConfigWrite(_)
                | RuntrackError::ArtifactCopy { .. }
                | RuntrackError::Io(_)
                | RuntrackError::Arrow(_)
                | RuntrackError::Parquet(_)
                | RuntrackError::Yaml(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RuntrackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_errors_are_not_io_class() {
        assert!(!RuntrackError::ChannelClosed.is_io_class());
        assert!(!RuntrackError::NoActiveRun.is_io_class());
        assert!(!RuntrackError::InvalidInput("x".into()).is_io_class());
        assert!(RuntrackError::MetricFlush("disk full".into()).is_io_class());
    }

    #[test]
    fn directory_create_names_the_path() {
        let err = RuntrackError::DirectoryCreate {
            path: PathBuf::from("/nope/run"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/nope/run"));
        assert!(msg.contains("denied"));
    }
}
