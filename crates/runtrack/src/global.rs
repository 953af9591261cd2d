//! Process-wide "current run".
//!
//! [`RunContext`] holds at most one open [`RunHandle`] behind a mutex.
//! That mutex is only held to look up or swap the handle, never across a
//! blocking close, so producers on other threads keep going while a run
//! finalizes. `init` and `close` serialize on a second lock: the previous
//! run is fully closed before the next one is installed. While that
//! happens, logging calls return `NoActiveRun`. The free functions in the
//! crate root forward to one static context.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use runtrack_core::{ParamValue, Result, RunConfig, RunHandle, RunStatus, RuntrackError};
use tracing::warn;

#[derive(Debug, Default)]
pub struct RunContext {
    current: Mutex<Option<RunHandle>>,
    lifecycle: Mutex<()>,
}

impl RunContext {
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the active run (if any), then open and install a new one.
    ///
    /// A failure to finalize the previous run is logged and does not stop
    /// the new run from starting.
    pub fn init(&self, config: RunConfig) -> Result<PathBuf> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.lock().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                warn!(run = %previous.run_name(), error = %e, "previous run closed with incomplete telemetry");
            }
        }
        let run = RunHandle::open(config)?;
        let run_dir = run.run_dir().to_path_buf();
        *self.lock() = Some(run);
        Ok(run_dir)
    }

    /// Run `f` against the active run.
    pub fn with_run<R>(&self, f: impl FnOnce(&RunHandle) -> Result<R>) -> Result<R> {
        match self.lock().as_ref() {
            Some(run) => f(run),
            None => Err(RuntrackError::NoActiveRun),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    pub fn run_dir(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|run| run.run_dir().to_path_buf())
    }

    pub fn log_params<I, K, V>(&self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        self.with_run(|run| run.log_params(params))
    }

    pub fn log_metrics<I, K, V>(&self, metrics: I, step: Option<u64>) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<f64>,
    {
        self.with_run(|run| run.log_metrics(metrics, step))
    }

    pub fn save_artifact(&self, path: impl AsRef<Path>) -> Result<()> {
        self.with_run(|run| run.save_artifact(path))
    }

    pub fn info(&self, message: impl Into<String>) -> Result<()> {
        self.with_run(|run| run.info(message))
    }

    pub fn warn(&self, message: impl Into<String>) -> Result<()> {
        self.with_run(|run| run.warn(message))
    }

    /// Close and uninstall the active run. No-op when none is active.
    pub fn close(&self) -> Result<()> {
        self.close_with_status(RunStatus::Finished)
    }

    pub fn close_with_status(&self, status: RunStatus) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let run = self.lock().take();
        match run {
            Some(run) => run.close_with_status(status),
            None => Ok(()),
        }
    }
}

/// Closes the global run when dropped, if one is still open.
///
/// A safety net for `main`: hold it for the life of the program. It does
/// not run on abort or `std::process::exit`, and nothing relies on it.
#[must_use = "the run is closed when the guard is dropped"]
#[derive(Debug)]
pub struct ExitGuard {
    _private: (),
}

impl ExitGuard {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Err(e) = crate::global().close() {
            warn!(error = %e, "global run closed with incomplete telemetry");
        }
    }
}
