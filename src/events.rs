//! In-process publish/subscribe for service lifecycle events.
//!
//! Publishing never blocks: a subscriber whose queue is full simply misses
//! the event. Lifecycle events are observational; a stalled SSE client must
//! not stall a start or stop transition.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Queue depth per subscriber before events are dropped.
const SUBSCRIBER_QUEUE_DEPTH: usize = 10;

/// A lifecycle event emitted on service transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Either "start" or "stop"
    #[serde(rename = "type")]
    pub kind: String,
    /// Name of the service
    pub service: String,
}

impl Event {
    pub fn start(service: impl Into<String>) -> Self {
        Self {
            kind: "start".to_string(),
            service: service.into(),
        }
    }

    pub fn stop(service: impl Into<String>) -> Self {
        Self {
            kind: "stop".to_string(),
            service: service.into(),
        }
    }
}

struct Subscribers {
    counter: u64,
    /// None once the bus is closed; publish and subscribe become no-ops
    table: Option<HashMap<u64, mpsc::Sender<Event>>>,
}

/// Lossy fan-out bus for [`Event`]s.
pub struct EventBus {
    subscribers: RwLock<Subscribers>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Subscribers {
                counter: 0,
                table: Some(HashMap::new()),
            }),
        }
    }

    /// Register a subscriber; returns its id and a bounded event queue.
    ///
    /// After [`close`](Self::close) the returned queue is already closed.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let mut subs = self.subscribers.write();
        let id = subs.counter;
        subs.counter += 1;
        if let Some(table) = subs.table.as_mut() {
            table.insert(id, tx);
        }
        (id, rx)
    }

    /// Remove a subscriber and close its queue. Safe to call twice.
    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.write();
        if let Some(table) = subs.table.as_mut() {
            table.remove(&id);
        }
    }

    /// Deliver an event to every subscriber that has room for it.
    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.read();
        let Some(table) = subs.table.as_ref() else {
            return;
        };
        for tx in table.values() {
            // Full or closed queues are skipped; never block the publisher.
            let _ = tx.try_send(event.clone());
        }
    }

    /// Close every queue and drop the table; later publishes are no-ops.
    pub fn close(&self) {
        self.subscribers.write().table = None;
    }
}
