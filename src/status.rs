// Progress events pushed by the pipeline for the presentation layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::DriverError;
use crate::pipeline::{JobOutcome, PipelineState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    EnumerateDevices,
    OpenDevice,
    Draw(usize),
    Commit,
    CloseDevice,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusKind {
    StateChanged {
        state: PipelineState,
    },
    StepStarted {
        step: Step,
    },
    DeviceSelected {
        name: String,
        description: String,
    },
    StepFinished {
        step: Step,
    },
    StepFailed {
        step: Step,
        error: String,
        code: Option<i32>,
    },
    Finished {
        outcome: JobOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub job_id: Uuid,
    /// Strictly increasing within one job.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StatusKind,
}

/// Passive consumer of pipeline progress.
pub trait StatusSink: Send + Sync {
    fn report(&self, event: StatusEvent);
}

/// Fans events out to any number of subscribers (e.g. SSE clients).
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
    sender: broadcast::Sender<StatusEvent>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl StatusSink for BroadcastReporter {
    fn report(&self, event: StatusEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanOut {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl StatusSink for FanOut {
    fn report(&self, event: StatusEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.report(event.clone());
            }
            last.report(event);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<StatusKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    /// States the pipeline passed through, in order.
    pub fn states(&self) -> Vec<PipelineState> {
        self.kinds()
            .into_iter()
            .filter_map(|k| match k {
                StatusKind::StateChanged { state } => Some(state),
                _ => None,
            })
            .collect()
    }
}

impl StatusSink for MemoryReporter {
    fn report(&self, event: StatusEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Stamps events for one job with its id and a sequence number.
pub(crate) struct JobReporter {
    sink: Arc<dyn StatusSink>,
    job_id: Uuid,
    seq: AtomicU64,
}

impl JobReporter {
    pub(crate) fn new(sink: Arc<dyn StatusSink>, job_id: Uuid) -> Self {
        Self {
            sink,
            job_id,
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn emit(&self, kind: StatusKind) {
        self.sink.report(StatusEvent {
            job_id: self.job_id,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            kind,
        });
    }

    pub(crate) fn started(&self, step: Step) {
        self.emit(StatusKind::StepStarted { step });
    }

    pub(crate) fn finished(&self, step: Step) {
        self.emit(StatusKind::StepFinished { step });
    }

    pub(crate) fn failed(&self, step: Step, error: &DriverError) {
        self.emit(StatusKind::StepFailed {
            step,
            error: error.to_string(),
            code: error.code(),
        });
    }
}
