//! Bounded history of recent recognitions, newest first.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::Serialize;

use crate::recognize::Identity;

pub const EVENT_LOG_CAPACITY: usize = 20;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecognitionEvent {
    pub id: u64,
    pub label: String,
    pub identity: Identity,
    pub timestamp: SystemTime,
    pub confidence: Option<f64>,
}

/// Entries are never mutated; overflow evicts the oldest.
#[derive(Clone, Debug)]
pub struct EventLog {
    entries: VecDeque<RecognitionEvent>,
    capacity: usize,
    next_id: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    /// Prepend one response's detections. Within the batch, detection order is kept.
    pub fn push_batch<I>(&mut self, batch: I, timestamp: SystemTime) -> usize
    where
        I: IntoIterator<Item = (String, Identity, Option<f64>)>,
    {
        let mut fresh = Vec::new();
        for (label, identity, confidence) in batch {
            fresh.push(RecognitionEvent {
                id: self.next_id,
                label,
                identity,
                timestamp,
                confidence,
            });
            self.next_id += 1;
        }
        let added = fresh.len();
        for event in fresh.into_iter().rev() {
            self.entries.push_front(event);
        }
        self.entries.truncate(self.capacity);
        added
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecognitionEvent> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&RecognitionEvent> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
