//! Event ingress: an unbounded multi-producer, single-consumer channel.
//!
//! `EventSender::send` is a tokio unbounded send plus a few relaxed atomic
//! updates. It never touches the filesystem and never blocks, so producers
//! pay on the order of 100ns per event. Backpressure shows up as queue
//! growth, visible through [`ChannelStats::high_water`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, RuntrackError};
use crate::models::{LogLevel, ParamValue, RunStatus};

/// How a metric row gets its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Explicit(u64),
    /// Assigned by the writer from the run-wide counter. All `len` entries
    /// of one `log_metrics` call share `call` and therefore one step.
    Auto { call: u64, len: usize },
}

#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub step: Step,
    pub wall_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactEvent {
    /// Absolute source path, resolved on the producer side.
    pub src: PathBuf,
    /// Destination relative to the run's `artifacts/` directory.
    pub dest: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Units of work handed from producers to the background writer.
#[derive(Debug)]
pub enum Event {
    Params(BTreeMap<String, ParamValue>),
    Metric(MetricEvent),
    Artifact(ArtifactEvent),
    Log(LogEvent),
    /// Flush everything received so far and report the outcome.
    Flush(oneshot::Sender<Result<()>>),
    /// Drain, flush, finalize metadata and stop.
    Shutdown { requested: RunStatus },
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Events accepted since the channel was created.
    pub sent: u64,
    /// Events accepted but not yet taken by the writer.
    pub pending: usize,
    /// Largest `pending` ever observed.
    pub high_water: usize,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    pending: AtomicUsize,
    high_water: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        EventSender {
            tx,
            counters: counters.clone(),
        },
        EventReceiver { rx, counters },
    )
}

/// Producer side. Cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
    counters: Arc<Counters>,
}

impl EventSender {
    /// Enqueue an event. Fails only once the writer has stopped accepting.
    pub fn send(&self, event: Event) -> Result<()> {
        let pending = self.counters.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if self.tx.send(event).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(RuntrackError::ChannelClosed);
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.counters.high_water.fetch_max(pending, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

/// Consumer side, owned by the background writer.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
    counters: Arc<Counters>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
        }
        event
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        let event = self.rx.try_recv().ok();
        if event.is_some() {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
        }
        event
    }

    /// Refuse further sends. Events already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Relaxed)
    }
}
