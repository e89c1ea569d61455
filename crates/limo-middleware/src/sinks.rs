//! Per-topic fan-out to console connections.
//!
//! Each console connection registers one *sink* per topic it serves and gets
//! back the receiving half of a bounded queue.  [`SinkTable::fan_out`] hands a
//! frame to every sink with `try_send`, so delivery never waits on a slow
//! console:
//!
//! - a full queue drops the frame for that sink only and logs a warning;
//! - a closed queue (connection gone without unregistering) removes the sink.

use std::fmt;

use dashmap::DashMap;
use limo_types::Topic;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Frames buffered per sink before new frames are dropped for it.
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// Identity of one registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(Uuid);

impl SinkId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of one [`SinkTable::fan_out`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub lagged: usize,
    pub closed: usize,
}

/// Concurrent table of the sinks of one topic.
pub struct SinkTable {
    topic: Topic,
    capacity: usize,
    sinks: DashMap<SinkId, mpsc::Sender<String>>,
}

impl SinkTable {
    pub fn new(topic: Topic, capacity: usize) -> Self {
        Self {
            topic,
            capacity: capacity.max(1),
            sinks: DashMap::new(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Register a new sink and return its id and frame receiver.
    pub fn register(&self) -> (SinkId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = SinkId::new();
        self.sinks.insert(id, tx);
        debug!(topic = %self.topic, sink = %id, sinks = self.sinks.len(), "sink registered");
        (id, rx)
    }

    /// Remove a sink.  Returns `false` if it was not registered.
    pub fn unregister(&self, id: SinkId) -> bool {
        let removed = self.sinks.remove(&id).is_some();
        if removed {
            debug!(topic = %self.topic, sink = %id, "sink unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Queue `frame` on every registered sink without waiting.
    pub fn fan_out(&self, frame: &str) -> FanOut {
        let mut outcome = FanOut::default();
        let mut closed = Vec::new();

        for entry in self.sinks.iter() {
            match entry.value().try_send(frame.to_string()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    outcome.lagged += 1;
                    warn!(topic = %self.topic, sink = %entry.key(), "sink lagging, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    outcome.closed += 1;
                    closed.push(*entry.key());
                }
            }
        }

        // Removal happens after the iteration guard is released.
        for id in closed {
            self.unregister(id);
        }
        outcome
    }
}

/// One [`SinkTable`] per console topic.
pub struct Sinks {
    map: SinkTable,
    position: SinkTable,
    goal: SinkTable,
}

impl Sinks {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: SinkTable::new(Topic::Map, capacity),
            position: SinkTable::new(Topic::Position, capacity),
            goal: SinkTable::new(Topic::Goal, capacity),
        }
    }

    pub fn table(&self, topic: Topic) -> &SinkTable {
        match topic {
            Topic::Map => &self.map,
            Topic::Position => &self.position,
            Topic::Goal => &self.goal,
        }
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_sink() {
        let table = SinkTable::new(Topic::Position, 8);
        let (_a, mut rx_a) = table.register();
        let (_b, mut rx_b) = table.register();

        let outcome = table.fan_out("r1 1.5,2.5,0.0");
        assert_eq!(outcome.delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), "r1 1.5,2.5,0.0");
        assert_eq!(rx_b.recv().await.unwrap(), "r1 1.5,2.5,0.0");
    }

    #[tokio::test]
    async fn full_sink_does_not_hold_back_others() {
        let table = SinkTable::new(Topic::Map, 1);
        let (_stuck, _rx_stuck) = table.register();
        let (_live, mut rx_live) = table.register();

        // The stuck sink never drains its queue.
        for i in 0..5 {
            let outcome = table.fan_out(&format!("frame {i}"));
            assert_eq!(outcome.delivered + outcome.lagged, 2);
            assert_eq!(rx_live.recv().await.unwrap(), format!("frame {i}"));
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn closed_sink_is_pruned() {
        let table = SinkTable::new(Topic::Goal, 4);
        let (_id, rx) = table.register();
        drop(rx);
        let outcome = table.fan_out("r1 remove");
        assert_eq!(outcome.closed, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn unregister_is_idempotent() {
        let table = SinkTable::new(Topic::Goal, 4);
        let (id, _rx) = table.register();
        assert!(table.unregister(id));
        assert!(!table.unregister(id));
        assert_eq!(table.fan_out("r1 remove").delivered, 0);
    }

    #[test]
    fn sinks_index_by_topic() {
        let sinks = Sinks::default();
        for topic in Topic::ALL {
            assert_eq!(sinks.table(topic).topic(), topic);
        }
    }
}
