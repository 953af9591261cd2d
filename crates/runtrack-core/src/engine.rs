//! `RunHandle`: the public front door of one tracked run.
//!
//! `RunHandle::open()` creates the run directory, writes the initial
//! metadata and spawns a [`BackgroundWriter`] on a dedicated tokio runtime
//! thread. Every `log_*` call is a channel send: O(1), no file I/O, never
//! blocks. `close()` is the only call that waits, and it waits until the
//! writer has drained the queue and finalized the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::{self, ArtifactEvent, ChannelStats, Event, EventSender, LogEvent, MetricEvent, Step};
use crate::error::{Result, RuntrackError};
use crate::layout::RunDirectory;
use crate::models::{LogLevel, ParamValue, RunConfig, RunStatus};
use crate::storage::artifacts::relative_destination;
use crate::writer::BackgroundWriter;

/// Steps are stored as `i64`.
const MAX_STEP: u64 = i64::MAX as u64;

/// Upper bound on the implicit close performed when a handle is dropped.
const DROP_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to one open run. Share it by reference (or in an `Arc`) across
/// producer threads; all logging methods take `&self`.
pub struct RunHandle {
    sender: EventSender,
    writer: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Keep the runtime alive as long as the handle exists.
    runtime: Arc<Runtime>,
    config: RunConfig,
    run_dir: PathBuf,
    next_call: AtomicU64,
}

impl RunHandle {
    /// Open a run: create its directory tree, persist the initial
    /// `RUNNING` document and start the background writer.
    pub fn open(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let dir = RunDirectory::create(&config)?;

        let (sender, receiver) = channel::channel();
        let writer = BackgroundWriter::new(&config, &dir, receiver)?;

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("runtrack-io")
                .enable_all()
                .build()
                .map_err(|e| RuntrackError::Runtime(e.to_string()))?,
        );
        let handle = runtime.spawn(writer.run());

        info!(
            experiment = %config.name,
            run = %config.run_name,
            run_dir = %dir.root().display(),
            "run opened"
        );

        Ok(Self {
            sender,
            writer: Mutex::new(Some(handle)),
            runtime,
            run_dir: dir.root().to_path_buf(),
            config,
            next_call: AtomicU64::new(0),
        })
    }

    /// Merge parameters into the run config (last write wins per key).
    pub fn log_params<I, K, V>(&self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        let mut mapping = BTreeMap::new();
        for (key, value) in params {
            let key = key.into();
            if key.is_empty() {
                return Err(RuntrackError::InvalidInput("parameter name is empty".into()));
            }
            mapping.insert(key, value.into());
        }
        if mapping.is_empty() {
            return Ok(());
        }
        self.sender.send(Event::Params(mapping))
    }

    /// Log one value per metric name, all stamped with the same wall time.
    ///
    /// Without `step`, the writer assigns the next value of a run-wide
    /// counter, shared by every entry of this call. Explicit steps must fit
    /// the stored `i64` column.
    ///
    /// Entries are sent one event each. A `close()` racing with this call
    /// on another thread can cut it short: the entries sent before the
    /// channel closed are persisted, the rest return `ChannelClosed`.
    pub fn log_metrics<I, K, V>(&self, metrics: I, step: Option<u64>) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<f64>,
    {
        let entries: Vec<(String, f64)> = metrics
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        if entries.iter().any(|(name, _)| name.is_empty()) {
            return Err(RuntrackError::InvalidInput("metric name is empty".into()));
        }
        if let Some(step) = step.filter(|&step| step > MAX_STEP) {
            return Err(RuntrackError::InvalidInput(format!(
                "step {step} exceeds the largest storable step {MAX_STEP}"
            )));
        }
        if entries.is_empty() {
            return Ok(());
        }
        if self.sender.is_closed() {
            return Err(RuntrackError::ChannelClosed);
        }

        let step = match step {
            Some(step) => Step::Explicit(step),
            None => Step::Auto {
                call: self.next_call.fetch_add(1, Ordering::Relaxed),
                len: entries.len(),
            },
        };
        let wall_time = Utc::now();
        let events: Vec<Event> = entries
            .into_iter()
            .map(|(name, value)| {
                Event::Metric(MetricEvent {
                    name,
                    value,
                    step,
                    wall_time,
                })
            })
            .collect();
        for event in events {
            self.sender.send(event)?;
        }
        Ok(())
    }

    /// Copy a file into `artifacts/`, keeping a relative path's structure
    /// (an absolute path keeps only its file name). Returns before the copy
    /// happens; `close()` waits for it.
    pub fn save_artifact(&self, path: impl AsRef<Path>) -> Result<()> {
        self.enqueue_artifact(path.as_ref(), None)
    }

    /// Like [`save_artifact`](Self::save_artifact) with an explicit
    /// destination relative to `artifacts/`.
    pub fn save_artifact_as(&self, path: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
        self.enqueue_artifact(path.as_ref(), Some(dest.as_ref()))
    }

    fn enqueue_artifact(&self, path: &Path, dest: Option<&Path>) -> Result<()> {
        let dest = relative_destination(path, dest)?;
        let src = std::path::absolute(path)?;
        self.sender.send(Event::Artifact(ArtifactEvent { src, dest }))
    }

    pub fn info(&self, message: impl Into<String>) -> Result<()> {
        self.log_message(LogLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> Result<()> {
        self.log_message(LogLevel::Warn, message)
    }

    /// Append a line to the run log. Non-blocking.
    pub fn log_message(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.sender.send(Event::Log(LogEvent {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }))
    }

    /// Block until everything enqueued so far is flushed.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(Event::Flush(tx))?;
        self.runtime
            .block_on(rx)
            .map_err(|_| RuntrackError::ChannelClosed)?
    }

    /// Finish the run as `FINISHED` (or `FAILED` if telemetry failed).
    pub fn close(&self) -> Result<()> {
        self.close_with_status(RunStatus::Finished)
    }

    /// Gracefully shut down: drain the queue, flush, wait for artifact
    /// copies, write final metadata. Blocks until the writer has stopped.
    ///
    /// A second call is a no-op. An error means the final flush or metadata
    /// write failed after retries; see `status` in `config.yaml`.
    pub fn close_with_status(&self, status: RunStatus) -> Result<()> {
        let Some(handle) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        // The writer may already be gone; joining reports why.
        let _ = self.sender.send(Event::Shutdown { requested: status });
        let outcome = self
            .runtime
            .block_on(handle)
            .map_err(|e| RuntrackError::Runtime(e.to_string()))?;
        info!(run = %self.config.run_name, "run closed");
        outcome
    }

    pub fn is_closed(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_name(&self) -> &str {
        &self.config.run_name
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn stats(&self) -> ChannelStats {
        self.sender.stats()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        // Best-effort graceful shutdown on drop
        let Some(handle) = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let _ = self.sender.send(Event::Shutdown {
            requested: RunStatus::Finished,
        });
        let joined = self
            .runtime
            .block_on(async { tokio::time::timeout(DROP_CLOSE_TIMEOUT, handle).await });
        if joined.is_err() {
            warn!(run = %self.config.run_name, "run not finalized within timeout on drop");
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("experiment", &self.config.name)
            .field("run", &self.config.run_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
