//! Goal-echo suppression for one console connection.
//!
//! A goal a console sends travels through the bus and comes back to every
//! goal sink, including the sender's own.  The connection records each
//! instruction it publishes and drops the first matching frame on the way
//! back.  Entries expire after a TTL so a publish that never returns cannot
//! swallow a later identical goal from another console.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default lifetime of an unmatched entry.
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(5);

/// Multiset of recently sent frames with per-entry expiry.
#[derive(Debug)]
pub struct EchoFilter {
    ttl: Duration,
    pending: VecDeque<(String, Instant)>,
}

impl EchoFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: VecDeque::new(),
        }
    }

    /// Remember that `frame` was just sent by this connection.
    pub fn record(&mut self, frame: &str) {
        self.record_at(frame, Instant::now());
    }

    pub fn record_at(&mut self, frame: &str, now: Instant) {
        self.expire(now);
        self.pending.push_back((frame.to_string(), now + self.ttl));
    }

    /// `true` if `frame` is the echo of a recorded send; the entry is
    /// consumed.
    pub fn suppress(&mut self, frame: &str) -> bool {
        self.suppress_at(frame, Instant::now())
    }

    pub fn suppress_at(&mut self, frame: &str, now: Instant) -> bool {
        self.expire(now);
        match self.pending.iter().position(|(sent, _)| sent == frame) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        // Entries are pushed in time order, so expired ones sit at the front.
        while self
            .pending
            .front()
            .is_some_and(|(_, deadline)| *deadline <= now)
        {
            self.pending.pop_front();
        }
    }
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TTL)
    }
}
