//! The background writer: sole owner of a run's files.
//!
//! One writer task runs per open run. It receives events from the channel,
//! buffers metric rows and parameters in memory, and flushes them when
//! either `flush_interval_rows` rows are buffered or `flush_interval_ms`
//! has passed since the last flush. Failed writes are retried with
//! exponential backoff; if retries run out the run is marked `FAILED` and
//! the writer carries on.
//!
//! ```text
//! Idle ──run()──▶ Running ──Shutdown──▶ Draining ──▶ Stopped
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::{Event, EventReceiver, LogEvent, MetricEvent, Step};
use crate::error::{Result, RuntrackError};
use crate::layout::RunDirectory;
use crate::models::{ConfigDocument, LogLevel, ParamValue, RetryPolicy, RunConfig, RunMetadata, RunStatus};
use crate::storage::{ArtifactCopier, ColumnStore, ConfigStore, CopyProgress, MetricRow, RunLog};

/// Events taken from the queue between two artifact chunks.
const EVENTS_PER_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Running,
    Draining,
    Stopped,
}

pub struct BackgroundWriter {
    state: WriterState,
    rx: EventReceiver,
    flush_rows: usize,
    flush_interval: Duration,
    retry: RetryPolicy,

    buffer: Vec<MetricRow>,
    next_seq: u64,
    next_auto_step: u64,
    /// Auto-step calls whose entries have not all arrived: call -> (step, remaining).
    open_calls: HashMap<u64, (u64, usize)>,
    params: BTreeMap<String, ParamValue>,
    meta: RunMetadata,
    config_dirty: bool,
    last_flush: Instant,

    columns: ColumnStore,
    config_store: ConfigStore,
    copier: ArtifactCopier,
    run_log: RunLog,
}

impl BackgroundWriter {
    /// Build the writer and persist the initial `RUNNING` document.
    pub fn new(config: &RunConfig, dir: &RunDirectory, rx: EventReceiver) -> Result<Self> {
        let config_store = ConfigStore::new(dir.config_path());
        let meta = RunMetadata::started(config);
        config_store.write(&ConfigDocument {
            params: BTreeMap::new(),
            run: meta.clone(),
        })?;

        Ok(Self {
            state: WriterState::Idle,
            rx,
            flush_rows: config.flush_interval_rows.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            retry: config.retry,
            buffer: Vec::with_capacity(config.flush_interval_rows.min(4096) * 2),
            next_seq: 0,
            next_auto_step: 0,
            open_calls: HashMap::new(),
            params: BTreeMap::new(),
            meta,
            config_dirty: false,
            last_flush: Instant::now(),
            columns: ColumnStore::open(dir.metrics_dir())?,
            config_store,
            copier: ArtifactCopier::new(dir.artifacts_dir(), config.copy_chunk_bytes),
            run_log: RunLog::new(dir.log_path()),
        })
    }

    /// Process events until shutdown, then drain and finalize.
    ///
    /// Returns an error only if the final flush or the final metadata write
    /// could not be completed; the run is then marked `FAILED` on disk
    /// whenever the document itself is still writable.
    pub async fn run(mut self) -> Result<()> {
        self.state = WriterState::Running;
        self.last_flush = Instant::now();
        info!(experiment = %self.meta.experiment, run = %self.meta.name, "writer started");

        let requested = 'run: loop {
            if self.copier.is_busy() {
                self.copy_chunk();
                let mut budget = EVENTS_PER_CHUNK;
                while budget > 0 && self.rx.pending() > 0 {
                    let Some(event) = self.rx.try_recv() else { break };
                    if let Some(status) = self.dispatch(event).await {
                        break 'run status;
                    }
                    budget -= 1;
                }
                self.maybe_flush().await;
                tokio::task::yield_now().await;
                continue;
            }

            let timer_armed = self.has_unflushed();
            let deadline = self.last_flush + self.flush_interval;
            tokio::select! {
                biased;

                event = self.rx.recv() => match event {
                    Some(event) => {
                        if let Some(status) = self.dispatch(event).await {
                            break 'run status;
                        }
                    }
                    // Every sender is gone without a shutdown request.
                    None => break 'run RunStatus::Finished,
                },

                _ = sleep_until(deadline), if timer_armed => {
                    // Failures are already recorded in the run status.
                    let _ = self.flush().await;
                }
            }
        };

        self.drain(requested).await
    }

    /// Apply one event. Returns the requested final status on shutdown.
    async fn dispatch(&mut self, event: Event) -> Option<RunStatus> {
        match event {
            Event::Params(params) => {
                self.params.extend(params);
                self.config_dirty = true;
            }
            Event::Metric(metric) => {
                self.push_metric(metric);
            }
            Event::Artifact(artifact) => {
                self.copier.enqueue(artifact);
            }
            Event::Log(LogEvent {
                level,
                message,
                timestamp,
            }) => {
                if let Err(e) = self.run_log.append(level, timestamp, &message) {
                    error!(error = %e, "failed to append to run log");
                }
            }
            Event::Flush(reply) => {
                let result = self.flush().await;
                let _ = reply.send(result);
                return None;
            }
            Event::Shutdown { requested } => {
                if self.state == WriterState::Running {
                    self.state = WriterState::Draining;
                    return Some(requested);
                }
                debug!(state = ?self.state, "shutdown already in progress, request ignored");
                return None;
            }
        }
        self.maybe_flush().await;
        None
    }

    fn push_metric(&mut self, metric: MetricEvent) {
        let step = match metric.step {
            Step::Explicit(step) => step,
            Step::Auto { call, len } => self.auto_step(call, len),
        };
        self.buffer.push(MetricRow {
            seq: self.next_seq,
            name: metric.name,
            value: metric.value,
            step,
            wall_time: metric.wall_time,
        });
        self.next_seq += 1;
    }

    /// One run-wide counter: every `log_metrics` call without an explicit
    /// step takes the next value, shared by all of that call's entries.
    fn auto_step(&mut self, call: u64, len: usize) -> u64 {
        if let Some((step, remaining)) = self.open_calls.get_mut(&call) {
            let step = *step;
            *remaining -= 1;
            if *remaining == 0 {
                self.open_calls.remove(&call);
            }
            return step;
        }
        let step = self.next_auto_step;
        self.next_auto_step += 1;
        if len > 1 {
            self.open_calls.insert(call, (step, len - 1));
        }
        step
    }

    fn has_unflushed(&self) -> bool {
        !self.buffer.is_empty() || self.config_dirty
    }

    async fn maybe_flush(&mut self) {
        let rows_due = self.buffer.len() >= self.flush_rows;
        let time_due = self.has_unflushed() && self.last_flush.elapsed() >= self.flush_interval;
        if rows_due || time_due {
            let _ = self.flush().await;
        }
    }

    /// Persist the metric buffer as one batch, then the config document.
    /// Returns the first failure after retries; the writer state is reset
    /// either way.
    async fn flush(&mut self) -> Result<()> {
        let metrics = self.flush_metrics().await;
        let config = self.write_config().await;
        self.last_flush = Instant::now();
        metrics.and(config)
    }

    async fn flush_metrics(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        let policy = self.retry;
        let columns = &mut self.columns;
        match retry(policy, "metrics", || columns.append(&rows)).await {
            Ok(written) => {
                self.meta.total_rows += written as u64;
                self.meta.flushes += 1;
                for row in &rows {
                    self.meta.last_metrics.insert(row.name.clone(), row.value);
                }
                self.config_dirty = true;
                debug!(rows = written, total = self.meta.total_rows, "flushed metrics");
                Ok(())
            }
            Err(e) => {
                self.meta.dropped_rows += rows.len() as u64;
                let err = RuntrackError::MetricFlush(format!(
                    "{} rows dropped after {} attempts: {e}",
                    rows.len(),
                    policy.max_attempts
                ));
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn write_config(&mut self) -> Result<()> {
        if !self.config_dirty {
            return Ok(());
        }
        let doc = ConfigDocument {
            params: self.params.clone(),
            run: self.meta.clone(),
        };
        let policy = self.retry;
        let store = &self.config_store;
        match retry(policy, "config", || store.write(&doc)).await {
            Ok(()) => {
                self.config_dirty = false;
                Ok(())
            }
            Err(e) => {
                let err = RuntrackError::ConfigWrite(format!(
                    "gave up after {} attempts: {e}",
                    policy.max_attempts
                ));
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Exhausted retries: mark the run failed and leave a trace in the run log.
    fn record_failure(&mut self, err: &RuntrackError) {
        error!(run = %self.meta.name, error = %err, "telemetry write failed");
        self.meta.status = RunStatus::Failed;
        self.config_dirty = true;
        self.log_warning(&err.to_string());
    }

    fn log_warning(&mut self, message: &str) {
        if let Err(e) = self.run_log.append(LogLevel::Warn, Utc::now(), message) {
            error!(error = %e, "failed to append warning to run log");
        }
    }

    fn copy_chunk(&mut self) {
        let progress = self.copier.step();
        self.report_copy(progress);
    }

    fn report_copy(&mut self, progress: CopyProgress) {
        match progress {
            CopyProgress::Done { dest, bytes } => {
                debug!(dest = %dest.display(), bytes, "artifact saved");
            }
            CopyProgress::Failed(e) => {
                warn!(error = %e, "artifact copy failed");
                self.log_warning(&e.to_string());
            }
            CopyProgress::Idle | CopyProgress::Copying => {}
        }
    }

    /// Stop accepting, process what is queued, finish copies, final flush,
    /// finalize metadata.
    async fn drain(mut self, requested: RunStatus) -> Result<()> {
        self.state = WriterState::Draining;
        self.rx.close();
        while let Some(event) = self.rx.recv().await {
            self.dispatch(event).await;
        }
        for progress in self.copier.finish_all() {
            self.report_copy(progress);
        }

        let flushed = self.flush_metrics().await;

        let finished_at = Utc::now();
        self.meta.finished_at = Some(finished_at);
        self.meta.duration_secs =
            Some((finished_at - self.meta.started_at).num_milliseconds() as f64 / 1000.0);
        if requested == RunStatus::Failed {
            self.meta.status = RunStatus::Failed;
        } else if self.meta.status != RunStatus::Failed {
            self.meta.status = RunStatus::Finished;
        }
        self.config_dirty = true;
        let written = self.write_config().await;

        self.state = WriterState::Stopped;
        info!(
            experiment = %self.meta.experiment,
            run = %self.meta.name,
            status = %self.meta.status,
            rows = self.meta.total_rows,
            "writer stopped"
        );
        flushed.and(written)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts. Only I/O-class failures are retried.
async fn retry<T>(policy: RetryPolicy, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts || !e.is_io_class() => return Err(e),
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(target_file = what, attempt, error = %e, ?backoff, "write failed, retrying");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, EventSender};
    use crate::storage;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir, rows: usize, ms: u64) -> (RunConfig, RunDirectory, EventSender, BackgroundWriter) {
        let config = RunConfig::new("writer_exp", tmp.path())
            .with_run_name("r")
            .with_flush_interval_rows(rows)
            .with_flush_interval_ms(ms);
        let dir = RunDirectory::create(&config).unwrap();
        let (tx, rx) = channel();
        let writer = BackgroundWriter::new(&config, &dir, rx).unwrap();
        (config, dir, tx, writer)
    }

    fn metric(name: &str, value: f64, step: Step) -> Event {
        Event::Metric(MetricEvent {
            name: name.to_string(),
            value,
            step,
            wall_time: Utc::now(),
        })
    }

    #[test]
    fn auto_steps_are_shared_within_a_call() {
        let tmp = TempDir::new().unwrap();
        let (_, _, _tx, mut writer) = setup(&tmp, 1_000, 1_000);

        // Two calls of two entries each, interleaved.
        assert_eq!(writer.auto_step(10, 2), 0);
        assert_eq!(writer.auto_step(11, 2), 1);
        assert_eq!(writer.auto_step(10, 2), 0);
        assert_eq!(writer.auto_step(11, 2), 1);
        assert_eq!(writer.auto_step(12, 1), 2);
        assert!(writer.open_calls.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_and_finalizes() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 1_000, 60_000);

        for i in 0..5 {
            tx.send(metric("loss", i as f64, Step::Explicit(i))).unwrap();
        }
        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();
        // Queued behind the shutdown request: still processed.
        tx.send(metric("loss", 9.0, Step::Explicit(9))).unwrap();

        writer.run().await.unwrap();

        assert_eq!(storage::read_metrics(dir.root()).unwrap().len(), 6);
        let doc = storage::load_config(dir.root()).unwrap();
        assert_eq!(doc.run.status, RunStatus::Finished);
        assert_eq!(doc.run.total_rows, 6);
        assert!(doc.run.finished_at.is_some());
        assert!(tx.send(metric("late", 0.0, Step::Explicit(0))).is_err());
    }

    #[tokio::test]
    async fn row_trigger_flushes_exactly_at_threshold() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 3, 60_000);
        let handle = tokio::spawn(writer.run());

        for i in 0..3 {
            tx.send(metric("acc", 0.5, Step::Explicit(i))).unwrap();
        }
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        // The barrier runs after the three metrics, which already flushed.
        tx.send(Event::Flush(reply_tx)).unwrap();
        reply_rx.await.unwrap().unwrap();
        assert_eq!(storage::count_metric_rows(dir.root()).unwrap(), 3);

        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_flushes_without_reaching_row_threshold() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 1_000_000, 200);
        let handle = tokio::spawn(writer.run());

        tx.send(metric("loss", 1.0, Step::Explicit(0))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage::count_metric_rows(dir.root()).unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(storage::count_metric_rows(dir.root()).unwrap(), 1);

        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn params_are_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 10, 60_000);

        let first = BTreeMap::from([
            ("lr".to_string(), ParamValue::from(0.1)),
            ("batch".to_string(), ParamValue::from(32i64)),
        ]);
        let second = BTreeMap::from([("lr".to_string(), ParamValue::from(0.01))]);
        tx.send(Event::Params(first)).unwrap();
        tx.send(Event::Params(second)).unwrap();
        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();
        writer.run().await.unwrap();

        let doc = storage::load_config(dir.root()).unwrap();
        assert_eq!(doc.params["lr"].as_f64(), Some(0.01));
        assert_eq!(doc.params["batch"].as_i64(), Some(32));
    }

    #[tokio::test]
    async fn artifact_failure_is_logged_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 10, 60_000);

        tx.send(Event::Artifact(crate::channel::ArtifactEvent {
            src: tmp.path().join("does-not-exist.bin"),
            dest: "does-not-exist.bin".into(),
        }))
        .unwrap();
        tx.send(metric("loss", 0.3, Step::Explicit(0))).unwrap();
        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();
        writer.run().await.unwrap();

        let log = storage::read_run_log(dir.root()).unwrap();
        assert!(log.iter().any(|l| l.contains("[WARN]") && l.contains("does-not-exist.bin")));
        let doc = storage::load_config(dir.root()).unwrap();
        assert_eq!(doc.run.status, RunStatus::Finished);
        assert_eq!(doc.run.total_rows, 1);
    }

    #[tokio::test]
    async fn exhausted_metric_retries_mark_run_failed() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 1, 60_000);
        let writer = BackgroundWriter {
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff_ms: 1,
            },
            ..writer
        };
        // Replace the dataset directory with a file so segment writes fail.
        std::fs::remove_dir_all(dir.metrics_dir()).unwrap();
        std::fs::write(dir.metrics_dir(), b"blocked").unwrap();

        tx.send(metric("loss", 1.0, Step::Explicit(0))).unwrap();
        tx.send(metric("loss", 0.5, Step::Explicit(1))).unwrap();
        tx.send(Event::Log(LogEvent {
            level: LogLevel::Info,
            message: "still logging".into(),
            timestamp: Utc::now(),
        }))
        .unwrap();
        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();
        writer.run().await.unwrap();

        let doc = storage::load_config(dir.root()).unwrap();
        assert_eq!(doc.run.status, RunStatus::Failed);
        assert_eq!(doc.run.dropped_rows, 2);
        assert_eq!(doc.run.total_rows, 0);
        let log = storage::read_run_log(dir.root()).unwrap();
        assert!(log.iter().any(|l| l.contains("[WARN]") && l.contains("failed to flush metrics")));
        assert!(log.iter().any(|l| l.ends_with("still logging")));
    }

    fn fast_retry(writer: BackgroundWriter) -> BackgroundWriter {
        BackgroundWriter {
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff_ms: 1,
            },
            ..writer
        }
    }

    #[tokio::test]
    async fn final_flush_failure_fails_the_run_and_close() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 1_000_000, 60_000);
        let writer = fast_retry(writer);
        std::fs::remove_dir_all(dir.metrics_dir()).unwrap();
        std::fs::write(dir.metrics_dir(), b"blocked").unwrap();

        tx.send(metric("loss", 1.0, Step::Explicit(0))).unwrap();
        tx.send(metric("loss", 0.5, Step::Explicit(1))).unwrap();
        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();

        let err = writer.run().await.unwrap_err();
        assert!(matches!(err, RuntrackError::MetricFlush(_)), "got {err:?}");
        let doc = storage::load_config(dir.root()).unwrap();
        assert_eq!(doc.run.status, RunStatus::Failed);
        assert_eq!(doc.run.dropped_rows, 2);
        assert!(doc.run.finished_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_config_retries_surface_as_config_write() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 1_000_000, 60_000);
        let writer = fast_retry(writer);
        // The staging file cannot be created while a directory holds its name.
        std::fs::create_dir(dir.root().join("config.yaml.tmp")).unwrap();

        tx.send(Event::Params(BTreeMap::from([(
            "lr".to_string(),
            ParamValue::from(0.1),
        )])))
        .unwrap();
        tx.send(Event::Shutdown {
            requested: RunStatus::Finished,
        })
        .unwrap();

        let err = writer.run().await.unwrap_err();
        assert!(matches!(err, RuntrackError::ConfigWrite(_)), "got {err:?}");
        // The initial document is still the last one committed.
        let doc = storage::load_config(dir.root()).unwrap();
        assert_eq!(doc.run.status, RunStatus::Running);
        assert!(doc.params.is_empty());
        let log = storage::read_run_log(dir.root()).unwrap();
        assert!(log.iter().any(|l| l.contains("[WARN]") && l.contains("gave up after 2 attempts")));
    }

    #[tokio::test]
    async fn non_io_errors_are_not_retried() {
        let mut calls = 0;
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 1,
        };
        let result: Result<()> = retry(policy, "test", || {
            calls += 1;
            Err(RuntrackError::InvalidInput("bad step".into()))
        })
        .await;
        assert!(matches!(result, Err(RuntrackError::InvalidInput(_))));
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: Result<()> = retry(policy, "test", || {
            calls += 1;
            Err(RuntrackError::MetricFlush("disk full".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn shutdown_is_only_accepted_while_running() {
        let tmp = TempDir::new().unwrap();
        let (_, _, _tx, mut writer) = setup(&tmp, 10, 60_000);

        writer.state = WriterState::Running;
        let first = writer
            .dispatch(Event::Shutdown {
                requested: RunStatus::Finished,
            })
            .await;
        assert_eq!(first, Some(RunStatus::Finished));
        assert_eq!(writer.state, WriterState::Draining);

        let second = writer
            .dispatch(Event::Shutdown {
                requested: RunStatus::Failed,
            })
            .await;
        assert_eq!(second, None);
        assert_eq!(writer.state, WriterState::Draining);
    }

    #[tokio::test]
    async fn queued_second_shutdown_does_not_change_status() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 10, 60_000);
        for requested in [RunStatus::Finished, RunStatus::Failed] {
            tx.send(Event::Shutdown { requested }).unwrap();
        }
        writer.run().await.unwrap();
        assert_eq!(
            storage::load_config(dir.root()).unwrap().run.status,
            RunStatus::Finished
        );
    }

    #[tokio::test]
    async fn requested_failed_status_is_kept() {
        let tmp = TempDir::new().unwrap();
        let (_, dir, tx, writer) = setup(&tmp, 10, 60_000);
        tx.send(Event::Shutdown {
            requested: RunStatus::Failed,
        })
        .unwrap();
        writer.run().await.unwrap();
        assert_eq!(
            storage::load_config(dir.root()).unwrap().run.status,
            RunStatus::Failed
        );
    }
}
