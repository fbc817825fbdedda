use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ThreadId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    TurnStarted,
    NodeEntered { node: String },
    ToolStarted { call_id: String, name: String },
    ToolEnded { call_id: String, name: String, ok: bool },
    Token { text: String },
    TurnCompleted { steps: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub sequence: u64,
    pub thread_id: ThreadId,
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub occurred_at: DateTime<Utc>,
}

/// Receiver of progress events. Delivery is best effort: sinks must not block
/// and must swallow their own failures.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

#[derive(Clone, Default)]
pub struct InMemoryProgressSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl InMemoryProgressSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<ProgressKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl ProgressSink for InMemoryProgressSink {
    fn emit(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Stamps events for one turn with its thread id and a monotonic sequence.
///
/// Clones share the counter. Numbering and emitting happen under one lock, so
/// a sink receives events in sequence order even when concurrent tool tasks
/// report at the same time.
#[derive(Clone)]
pub struct ProgressReporter {
    thread_id: ThreadId,
    next_sequence: Arc<Mutex<u64>>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(thread_id: ThreadId, sink: Arc<dyn ProgressSink>) -> Self {
        Self { thread_id, next_sequence: Arc::new(Mutex::new(0)), sink }
    }

    pub fn report(&self, kind: ProgressKind) {
        let mut next_sequence = match self.next_sequence.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.sink.emit(ProgressEvent {
            sequence: *next_sequence,
            thread_id: self.thread_id.clone(),
            kind,
            occurred_at: Utc::now(),
        });
        *next_sequence += 1;
    }
}
