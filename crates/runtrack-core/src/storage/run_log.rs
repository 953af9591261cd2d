//! Plain-text run log: `[<timestamp>] [INFO|WARN] <message>` per line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::LogLevel;

pub struct RunLog {
    path: PathBuf,
    file: Option<File>,
}

impl RunLog {
    /// The file is opened lazily on the first line.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and hand it to the OS immediately.
    pub fn append(&mut self, level: LogLevel, timestamp: DateTime<Utc>, message: &str) -> Result<()> {
        let line = format_line(level, timestamp, message);
        let mut file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        };
        // A failed write drops the handle; the next line reopens it.
        file.write_all(line.as_bytes())?;
        self.file = Some(file);
        Ok(())
    }
}

pub fn format_line(level: LogLevel, timestamp: DateTime<Utc>, message: &str) -> String {
    let ts = timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
    format!("[{ts}] [{}] {message}\n", level.as_str())
}

pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::to_owned)
        .collect())
}
