//! Difference depth queue with content-comparison promotion

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::buffer::{MessageBuffer, QueuedMessage};
use super::comparison::{matching_pair, normalize, ComparisonBuffer};
use super::{AcceptanceState, GatingQueue, QueueStats};
use crate::stream_id::{IdentityKey, StreamIdentity};
use crate::types::{Market, QueueKey, StreamKind};

#[derive(Debug, Default)]
struct DepthState {
    acceptance: AcceptanceState,
    buffers: HashMap<IdentityKey, ComparisonBuffer>,
    /// Pair count set through `update_capacity`, overrides the identity's
    capacity: Option<usize>,
    stats: QueueStats,
}

/// Gating queue for `@depth@100ms` streams.
///
/// Every producer's recent frames are kept in a window sized to its pair
/// count. When the incumbent and the candidate windows agree, the newer
/// producer is accepted and the older one retired.
#[derive(Debug)]
pub struct DifferenceDepthQueue {
    key: QueueKey,
    state: Mutex<DepthState>,
    output: Arc<MessageBuffer>,
}

impl DifferenceDepthQueue {
    pub(crate) fn new(market: Market, output: Arc<MessageBuffer>) -> Self {
        Self {
            key: QueueKey::new(market, StreamKind::DifferenceDepth),
            state: Mutex::new(DepthState::default()),
            output,
        }
    }

    fn forward(&self, state: &mut DepthState, message: &str, received_at: i64) {
        self.output.push(QueuedMessage {
            market: self.key.market,
            kind: self.key.kind,
            payload: message.to_owned(),
            received_at,
        });
        state.stats.forwarded += 1;
    }

    /// Number of producers currently tracked for comparison
    pub fn tracked_producers(&self) -> usize {
        self.state.lock().buffers.len()
    }
}

impl GatingQueue for DifferenceDepthQueue {
    fn key(&self) -> QueueKey {
        self.key
    }

    fn put(&self, message: &str, producer: &StreamIdentity, received_at: i64) {
        let key = producer.key();
        let mut state = self.state.lock();

        let current = state.acceptance.accepted;
        let Some(accepted) = current else {
            info!("{}: accepting first producer {}", self.key, key);
            state.acceptance.accepted = Some(key);
            self.forward(&mut state, message, received_at);
            return;
        };

        if state.acceptance.retired == Some(key) {
            state.stats.dropped += 1;
            return;
        }

        if accepted == key {
            self.forward(&mut state, message, received_at);
        }

        let capacity = state.capacity.unwrap_or_else(|| producer.pair_count());
        state
            .buffers
            .entry(key)
            .or_insert_with(|| ComparisonBuffer::new(capacity))
            .push(normalize(message));

        if let Some((older, newer)) = matching_pair(&state.buffers) {
            if state.acceptance.accepted == Some(newer) {
                info!("{}: retiring stale stream {}", self.key, older);
            } else {
                info!("🔄 {}: switching accepted stream {} -> {}", self.key, older, newer);
                state.stats.promotions += 1;
            }
            state.acceptance.accepted = Some(newer);
            state.acceptance.retired = Some(older);
            state.acceptance.promoted = true;
            state.buffers.clear();
        }
    }

    fn accept(&self, identity: &StreamIdentity) -> bool {
        let mut state = self.state.lock();
        let current = state.acceptance.accepted;
        match current {
            None => {
                state.acceptance.accepted = Some(identity.key());
                debug!("{}: accepted {}", self.key, identity);
                true
            }
            Some(current) => current == identity.key(),
        }
    }

    fn acceptance(&self) -> AcceptanceState {
        self.state.lock().acceptance
    }

    fn take_promotion(&self) -> bool {
        std::mem::take(&mut self.state.lock().acceptance.promoted)
    }

    fn try_complete_handover(&self, candidate: &StreamIdentity) -> bool {
        let mut state = self.state.lock();
        if state.acceptance.promoted && state.acceptance.accepted == Some(candidate.key()) {
            state.acceptance.promoted = false;
            true
        } else {
            false
        }
    }

    fn update_capacity(&self, pair_count: usize) {
        if pair_count == 0 {
            warn!("{}: ignoring resize to zero pairs", self.key);
            return;
        }
        let mut state = self.state.lock();
        state.capacity = Some(pair_count);
        for buffer in state.buffers.values_mut() {
            buffer.resize(pair_count);
        }
    }

    fn release(&self, identity: &StreamIdentity) {
        self.state.lock().buffers.remove(&identity.key());
    }

    fn output(&self) -> &Arc<MessageBuffer> {
        &self.output
    }

    fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn depth(pair: &str, event_time: i64, update_id: u64) -> String {
        format!(
            r#"{{"stream":"{}@depth@100ms","data":{{"e":"depthUpdate","E":{},"s":"{}","U":{},"u":{},"b":[],"a":[]}}}}"#,
            pair.to_lowercase(),
            event_time,
            pair,
            update_id,
            update_id
        )
    }

    fn queue() -> DifferenceDepthQueue {
        DifferenceDepthQueue::new(Market::Spot, Arc::new(MessageBuffer::new()))
    }

    #[test]
    fn test_first_producer_is_accepted() {
        let q = queue();
        let a = StreamIdentity::with_timestamp(100, &pairs(&["BTCUSDT"])).unwrap();
        q.put(&depth("BTCUSDT", 1, 1), &a, 10);

        assert_eq!(q.acceptance().accepted, Some(a.key()));
        assert_eq!(q.output().len(), 1);
        assert_eq!(q.output().try_pop().unwrap().received_at, 10);
    }

    #[test]
    fn test_promotion_after_matching_windows() {
        let q = queue();
        let p = pairs(&["BTCUSDT", "ETHUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        assert!(q.accept(&a));

        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        q.put(&depth("ETHUSDT", 1, 2), &a, 2);
        assert_eq!(q.output().len(), 2);

        q.put(&depth("BTCUSDT", 3, 1), &b, 3);
        assert!(!q.acceptance().promoted);
        q.put(&depth("ETHUSDT", 3, 2), &b, 4);

        let state = q.acceptance();
        assert_eq!(state.accepted, Some(b.key()));
        assert_eq!(state.retired, Some(a.key()));
        assert!(state.promoted);
        assert_eq!(q.tracked_producers(), 0);
        // b's frames were not forwarded while a was accepted
        assert_eq!(q.output().len(), 2);

        q.put(&depth("BTCUSDT", 4, 3), &a, 5);
        assert_eq!(q.output().len(), 2);
        q.put(&depth("BTCUSDT", 4, 3), &b, 6);
        assert_eq!(q.output().len(), 3);
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.stats().promotions, 1);
    }

    #[test]
    fn test_repeated_stream_blocks_promotion() {
        let q = queue();
        let p = pairs(&["BTCUSDT", "ETHUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&a);

        for producer in [&a, &b] {
            q.put(&depth("BTCUSDT", 1, 1), producer, 1);
            q.put(&depth("BTCUSDT", 1, 1), producer, 2);
        }

        let state = q.acceptance();
        assert_eq!(state.accepted, Some(a.key()));
        assert!(!state.promoted);
    }

    #[test]
    fn test_diverging_windows_do_not_promote() {
        let q = queue();
        let p = pairs(&["BTCUSDT", "ETHUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&a);

        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        q.put(&depth("ETHUSDT", 1, 2), &a, 2);
        q.put(&depth("BTCUSDT", 1, 7), &b, 3);
        q.put(&depth("ETHUSDT", 1, 8), &b, 4);

        assert!(!q.acceptance().promoted);
        assert_eq!(q.tracked_producers(), 2);
    }

    #[test]
    fn test_retired_producer_never_reaches_output() {
        let q = queue();
        let p = pairs(&["BTCUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&a);
        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        q.put(&depth("BTCUSDT", 2, 1), &b, 2);
        assert_eq!(q.acceptance().retired, Some(a.key()));

        let before = q.output().len();
        for i in 0..10 {
            q.put(&depth("BTCUSDT", i, i as u64), &a, i);
        }
        assert_eq!(q.output().len(), before);
    }

    #[test]
    fn test_handover_is_consumed_once() {
        let q = queue();
        let p = pairs(&["BTCUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&a);
        assert!(!q.try_complete_handover(&b));

        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        q.put(&depth("BTCUSDT", 2, 1), &b, 2);

        assert!(!q.try_complete_handover(&a));
        assert!(q.try_complete_handover(&b));
        assert!(!q.try_complete_handover(&b));
        assert!(!q.take_promotion());
    }

    #[test]
    fn test_accept_keeps_existing_producer() {
        let q = queue();
        let p = pairs(&["BTCUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        assert!(q.accept(&a));
        assert!(q.accept(&a));
        assert!(!q.accept(&b));
        assert_eq!(q.acceptance().accepted, Some(a.key()));
    }

    #[test]
    fn test_update_capacity_to_current_is_noop() {
        let q = queue();
        let p = pairs(&["BTCUSDT", "ETHUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&a);
        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        q.put(&depth("ETHUSDT", 1, 2), &a, 2);
        q.put(&depth("BTCUSDT", 1, 1), &b, 3);

        q.update_capacity(2);
        q.update_capacity(0);

        q.put(&depth("ETHUSDT", 1, 2), &b, 4);
        assert_eq!(q.acceptance().accepted, Some(b.key()));
    }

    #[test]
    fn test_grown_capacity_needs_new_pair() {
        let q = queue();
        let p = pairs(&["BTCUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        let b = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&a);
        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        q.update_capacity(2);
        q.put(&depth("ETHUSDT", 1, 2), &a, 2);

        q.put(&depth("BTCUSDT", 1, 1), &b, 3);
        q.update_capacity(2);
        assert!(!q.acceptance().promoted);
        q.put(&depth("ETHUSDT", 1, 2), &b, 4);
        assert!(q.acceptance().promoted);
    }

    #[test]
    fn test_stale_older_producer_is_retired() {
        let q = queue();
        let p = pairs(&["BTCUSDT", "ETHUSDT"]);
        let stale = StreamIdentity::with_timestamp(100, &p).unwrap();
        let current = StreamIdentity::with_timestamp(200, &p).unwrap();
        q.accept(&current);

        q.put(&depth("BTCUSDT", 1, 1), &current, 1);
        q.put(&depth("ETHUSDT", 1, 2), &current, 2);
        q.put(&depth("BTCUSDT", 2, 1), &stale, 3);
        q.put(&depth("ETHUSDT", 2, 2), &stale, 4);

        let state = q.acceptance();
        assert_eq!(state.accepted, Some(current.key()));
        assert_eq!(state.retired, Some(stale.key()));
        assert_eq!(q.tracked_producers(), 0);
        assert_eq!(q.stats().promotions, 0);

        q.put(&depth("BTCUSDT", 3, 3), &stale, 5);
        assert_eq!(q.tracked_producers(), 0);
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.output().len(), 2);
    }

    #[test]
    fn test_release_drops_comparison_state() {
        let q = queue();
        let p = pairs(&["BTCUSDT", "ETHUSDT"]);
        let a = StreamIdentity::with_timestamp(100, &p).unwrap();
        q.accept(&a);
        q.put(&depth("BTCUSDT", 1, 1), &a, 1);
        assert_eq!(q.tracked_producers(), 1);
        q.release(&a);
        assert_eq!(q.tracked_producers(), 0);
    }
}
