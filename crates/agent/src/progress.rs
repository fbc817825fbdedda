use tokio::sync::broadcast;

use datapilot_core::{ProgressEvent, ProgressSink};

/// Fans progress events out to any number of live subscribers. Events emitted
/// while nobody listens, or that a lagging subscriber misses, are dropped.
#[derive(Clone)]
pub struct BroadcastProgressSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for BroadcastProgressSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}
