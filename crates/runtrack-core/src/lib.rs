//! runtrack-core: non-blocking run-tracking engine.
//!
//! The central design principle: `log_metrics()` is a channel send (~100ns),
//! never blocking the training process. A background writer task owns every
//! file of the run and persists events in batches.
//!
//! A run lives in `base_dir/<experiment>/<run>/`:
//!
//! | Path | Content |
//! |---|---|
//! | `config.yaml` | merged parameters + run metadata |
//! | `metrics.parquet/part-*.parquet` | one Parquet segment per flush |
//! | `run.log` | info/warn lines with timestamps |
//! | `artifacts/` | copied artifact files |

pub mod channel;
pub mod engine;
pub mod error;
pub mod layout;
pub mod models;
pub mod storage;
pub mod writer;

pub use channel::ChannelStats;
pub use engine::RunHandle;
pub use error::{Result, RuntrackError};
pub use layout::RunDirectory;
pub use models::{
    ConfigDocument, LogLevel, MetricRecord, ParamValue, RetryPolicy, RunConfig, RunMetadata,
    RunStatus,
};
pub use writer::BackgroundWriter;
