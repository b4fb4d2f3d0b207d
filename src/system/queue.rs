//! Time-ordered event buffer with a reorder horizon.
//!
//! Events are released in `(timestamp, kind priority, arrival)` order once
//! the newest timestamp seen is more than `horizon` seconds ahead of them,
//! so moderately out-of-order arrival across sensors is absorbed.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::messages::Event;

struct Queued {
    event: Event,
    seq: u64,
}

impl Queued {
    fn key(&self) -> (f64, u8, u64) {
        (self.event.timestamp(), self.event.priority(), self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ta, pa, sa) = self.key();
        let (tb, pb, sb) = other.key();
        ta.total_cmp(&tb).then(pa.cmp(&pb)).then(sa.cmp(&sb))
    }
}

pub struct EventQueue {
    heap: BinaryHeap<Reverse<Queued>>,
    horizon: f64,
    newest: f64,
    seq: u64,
}

impl EventQueue {
    pub fn new(horizon: f64) -> Self {
        Self { heap: BinaryHeap::new(), horizon, newest: f64::NEG_INFINITY, seq: 0 }
    }

    pub fn push(&mut self, event: Event) {
        self.newest = self.newest.max(event.timestamp());
        self.heap.push(Reverse(Queued { event, seq: self.seq }));
        self.seq += 1;
    }

    /// Oldest event if it is older than the horizon allows to wait for.
    pub fn pop_ready(&mut self) -> Option<Event> {
        let ready = self
            .heap
            .peek()
            .is_some_and(|Reverse(q)| q.event.timestamp() <= self.newest - self.horizon);
        if ready {
            self.pop_any()
        } else {
            None
        }
    }

    /// Oldest event regardless of the horizon.
    pub fn pop_any(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(q)| q.event)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.newest = f64::NEG_INFINITY;
    }
}
