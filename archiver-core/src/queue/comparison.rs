//! Content comparison used as a liveness proof during handover.
//!
//! Two sockets subscribed to the same pairs receive one update per pair in
//! every broadcast window. Once both have reported every pair and the last
//! `pair_count` messages agree (ignoring the event time, which differs by a
//! few milliseconds per socket) the newer socket is provably caught up.

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::stream_id::IdentityKey;

/// Message with the event-time field stripped, ready for comparison
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub stream: Option<String>,
    pub body: String,
}

/// Strip `E` (event time) from the envelope and from its `data` payload.
///
/// Frames that are not JSON objects are compared verbatim.
pub fn normalize(message: &str) -> NormalizedMessage {
    match serde_json::from_str::<Value>(message) {
        Ok(Value::Object(mut map)) => {
            let stream = map.get("stream").and_then(Value::as_str).map(str::to_owned);
            map.remove("E");
            if let Some(Value::Object(data)) = map.get_mut("data") {
                data.remove("E");
            }
            NormalizedMessage {
                stream,
                body: Value::Object(map).to_string(),
            }
        }
        _ => NormalizedMessage {
            stream: None,
            body: message.to_owned(),
        },
    }
}

/// Bounded window of the most recent normalized messages of one producer
#[derive(Clone, Debug)]
pub struct ComparisonBuffer {
    capacity: usize,
    entries: VecDeque<NormalizedMessage>,
}

impl ComparisonBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, message: NormalizedMessage) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    /// Change the window size, keeping the newest entries that still fit
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Number of different stream names in the window
    pub fn distinct_streams(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|m| m.stream.as_deref())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Order-sensitive equality of the normalized bodies
    pub fn same_sequence(&self, other: &ComparisonBuffer) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(other.entries.iter()).all(|(a, b)| a.body == b.body)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NormalizedMessage> {
        self.entries.iter()
    }

    /// Full window holding one message per subscribed pair
    fn covers_every_pair(&self) -> bool {
        self.is_full() && self.distinct_streams() == self.capacity
    }
}

/// Decide whether the tracked producers prove a safe handover.
///
/// Returns `(older, newer)` when exactly two producers are tracked, both
/// windows cover every pair and the windows agree message for message.
pub fn matching_pair(buffers: &HashMap<IdentityKey, ComparisonBuffer>) -> Option<(IdentityKey, IdentityKey)> {
    if buffers.len() != 2 {
        return None;
    }

    let mut tracked = buffers.iter();
    let (first_key, first) = tracked.next()?;
    let (second_key, second) = tracked.next()?;

    if !first.covers_every_pair() || !second.covers_every_pair() {
        return None;
    }
    if !first.same_sequence(second) {
        return None;
    }

    if first_key < second_key {
        Some((*first_key, *second_key))
    } else {
        Some((*second_key, *first_key))
    }
}
