// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast event bus feeding the SSE streams.
//!
//! Every state transition of every execution is published once; SSE
//! handlers subscribe and filter. Lagged subscribers drop frames rather
//! than blocking publishers.

use crate::index::ExecutionRecord;
use tokio::sync::broadcast;

/// Default backlog before slow subscribers start losing frames.
const DEFAULT_CAPACITY: usize = 256;

/// Pub/sub hub for execution state transitions.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionRecord>,
}

impl EventBus {
    /// Bus with the default backlog.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionRecord> {
        self.tx.subscribe()
    }

    /// Publish a transition; a send with no subscribers is fine.
    pub fn publish(&self, record: &ExecutionRecord) {
        let _ = self.tx.send(record.clone());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
