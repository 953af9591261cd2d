//! runtrack: experiment run tracking for training loops.
//!
//! Use [`RunHandle`] directly, or the process-wide run behind the free
//! functions:
//!
//! ```no_run
//! let _guard = runtrack::exit_guard();
//! runtrack::init(runtrack::RunConfig::new("mnist", "experiments"))?;
//! runtrack::log_params([("lr", 0.01)])?;
//! for step in 0..100u64 {
//!     runtrack::log_metrics([("loss", 1.0 / (step + 1) as f64)], Some(step))?;
//! }
//! runtrack::close()?;
//! # Ok::<(), runtrack::RuntrackError>(())
//! ```

pub mod global;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

pub use global::{ExitGuard, RunContext};
pub use runtrack_core::*;

static GLOBAL: RunContext = RunContext::new();
static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// The process-wide run context.
pub fn global() -> &'static RunContext {
    &GLOBAL
}

/// Close the current global run (if any) and start a new one.
pub fn init(config: RunConfig) -> Result<PathBuf> {
    GLOBAL.init(config)
}

pub fn log_params<I, K, V>(params: I) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParamValue>,
{
    GLOBAL.log_params(params)
}

pub fn log_metrics<I, K, V>(metrics: I, step: Option<u64>) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<f64>,
{
    GLOBAL.log_metrics(metrics, step)
}

pub fn save_artifact(path: impl AsRef<Path>) -> Result<()> {
    GLOBAL.save_artifact(path)
}

pub fn info(message: impl Into<String>) -> Result<()> {
    GLOBAL.info(message)
}

pub fn warn(message: impl Into<String>) -> Result<()> {
    GLOBAL.warn(message)
}

/// Flush and close the current global run.
pub fn close() -> Result<()> {
    GLOBAL.close()
}

/// Guard that closes the global run when dropped.
pub fn exit_guard() -> ExitGuard {
    ExitGuard::new()
}

/// Install a compact `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). Later calls are no-ops.
pub fn init_tracing() {
    install_subscriber(false);
}

/// Same as [`init_tracing`] with JSON lines output.
pub fn init_tracing_json() {
    install_subscriber(true);
}

fn install_subscriber(json: bool) {
    if TRACING_INITIALIZED.set(()).is_err() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if let Err(e) = installed {
        tracing::debug!(error = %e, "tracing subscriber already initialized");
    }
}
