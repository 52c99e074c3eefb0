//! Trade queue: same gating rules, handover aligned on trade ids.
//!
//! Trades are not broadcast per window, so two sockets cannot be compared
//! frame for frame. Every trade carries a per-symbol monotonic id `t`
//! instead. A candidate's frames are held back until, for every stream it
//! delivered, it has sent an id the incumbent already forwarded. Promotion
//! then flushes the held frames past the last forwarded id, and the
//! accepted producer never forwards an id at or below it.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::buffer::{MessageBuffer, QueuedMessage};
use super::{AcceptanceState, GatingQueue, QueueStats};
use crate::stream_id::{IdentityKey, StreamIdentity};
use crate::types::{Market, QueueKey, StreamKind};

/// Stream name and trade id of a combined-stream trade frame
fn trade_id(message: &str) -> Option<(String, u64)> {
    let value: serde_json::Value = serde_json::from_str(message).ok()?;
    let stream = value.get("stream")?.as_str()?.to_owned();
    let id = value.get("data")?.get("t")?.as_u64()?;
    Some((stream, id))
}

#[derive(Debug)]
struct HeldTrade {
    stream: String,
    id: u64,
    payload: String,
    received_at: i64,
}

/// Frames of a producer that is not accepted yet
#[derive(Debug, Default)]
struct CandidateTrades {
    held: Vec<HeldTrade>,
    /// Streams the candidate delivered at all
    seen: HashSet<String>,
    /// Streams where the candidate repeated an id already forwarded
    overlapped: HashSet<String>,
}

#[derive(Debug, Default)]
struct TradeState {
    acceptance: AcceptanceState,
    /// Highest trade id forwarded per stream
    last_forwarded: HashMap<String, u64>,
    candidates: HashMap<IdentityKey, CandidateTrades>,
    stats: QueueStats,
}

impl TradeState {
    fn already_forwarded(&self, stream: &str, id: u64) -> bool {
        self.last_forwarded.get(stream).is_some_and(|last| id <= *last)
    }

    /// Move held frames the incumbent has caught up with into the overlap set
    fn settle(&mut self, candidate: IdentityKey) {
        let Some(mut trades) = self.candidates.remove(&candidate) else {
            return;
        };
        let held = std::mem::take(&mut trades.held);
        for trade in held {
            if self.already_forwarded(&trade.stream, trade.id) {
                trades.overlapped.insert(trade.stream);
            } else {
                trades.held.push(trade);
            }
        }
        self.candidates.insert(candidate, trades);
    }

    /// True once every stream the candidate delivered overlaps the output
    fn is_aligned(&self, candidate: IdentityKey) -> bool {
        self.candidates
            .get(&candidate)
            .is_some_and(|trades| !trades.seen.is_empty() && trades.seen.is_subset(&trades.overlapped))
    }
}

#[derive(Debug)]
pub struct TradeQueue {
    key: QueueKey,
    state: Mutex<TradeState>,
    output: Arc<MessageBuffer>,
}

impl TradeQueue {
    pub(crate) fn new(market: Market, output: Arc<MessageBuffer>) -> Self {
        Self {
            key: QueueKey::new(market, StreamKind::Trade),
            state: Mutex::new(TradeState::default()),
            output,
        }
    }

    /// Accept `candidate` and retire the current producer without waiting
    /// for the candidate to catch up
    pub fn promote(&self, candidate: &StreamIdentity) {
        let mut state = self.state.lock();
        self.promote_locked(&mut state, candidate.key());
    }

    fn promote_locked(&self, state: &mut TradeState, candidate: IdentityKey) {
        if state.acceptance.accepted == Some(candidate) {
            return;
        }
        info!(
            "🔄 {}: switching accepted stream {} -> {}",
            self.key,
            state.acceptance.accepted.map(|k| k.to_string()).unwrap_or_default(),
            candidate
        );
        state.acceptance.retired = state.acceptance.accepted;
        state.acceptance.accepted = Some(candidate);
        state.acceptance.promoted = true;
        state.stats.promotions += 1;

        let held = state.candidates.remove(&candidate).map(|t| t.held).unwrap_or_default();
        for trade in held {
            if state.already_forwarded(&trade.stream, trade.id) {
                continue;
            }
            state.last_forwarded.insert(trade.stream, trade.id);
            self.forward(state, &trade.payload, trade.received_at);
        }
    }

    /// Forward a frame of the accepted producer unless its id was already sent
    fn forward_accepted(&self, state: &mut TradeState, message: &str, received_at: i64) {
        if let Some((stream, id)) = trade_id(message) {
            if state.already_forwarded(&stream, id) {
                state.stats.dropped += 1;
                return;
            }
            state.last_forwarded.insert(stream, id);
        }
        self.forward(state, message, received_at);
    }

    fn hold(&self, state: &mut TradeState, producer: IdentityKey, message: &str, received_at: i64) {
        let Some((stream, id)) = trade_id(message) else {
            return;
        };
        let overlaps = state.already_forwarded(&stream, id);
        let trades = state.candidates.entry(producer).or_default();
        if trades.seen.insert(stream.clone()) && trades.seen.len() == 1 {
            debug!("{}: candidate {} is delivering", self.key, producer);
        }
        if overlaps {
            trades.overlapped.insert(stream);
        } else {
            trades.held.push(HeldTrade {
                stream,
                id,
                payload: message.to_owned(),
                received_at,
            });
        }
    }

    fn forward(&self, state: &mut TradeState, message: &str, received_at: i64) {
        self.output.push(QueuedMessage {
            market: self.key.market,
            kind: self.key.kind,
            payload: message.to_owned(),
            received_at,
        });
        state.stats.forwarded += 1;
    }
}

impl GatingQueue for TradeQueue {
    fn key(&self) -> QueueKey {
        self.key
    }

    fn put(&self, message: &str, producer: &StreamIdentity, received_at: i64) {
        let key = producer.key();
        let mut state = self.state.lock();
        let accepted = state.acceptance.accepted;
        let retired = state.acceptance.retired;

        match accepted {
            None => {
                info!("{}: accepting first producer {}", self.key, key);
                state.acceptance.accepted = Some(key);
                self.forward_accepted(&mut state, message, received_at);
            }
            Some(accepted) if accepted == key => self.forward_accepted(&mut state, message, received_at),
            Some(_) if retired == Some(key) => state.stats.dropped += 1,
            Some(_) => self.hold(&mut state, key, message, received_at),
        }
    }

    fn accept(&self, identity: &StreamIdentity) -> bool {
        let mut state = self.state.lock();
        let current = state.acceptance.accepted;
        match current {
            None => {
                state.acceptance.accepted = Some(identity.key());
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
        let key = candidate.key();
        let mut state = self.state.lock();
        state.settle(key);
        if state.is_aligned(key) {
            self.promote_locked(&mut state, key);
        }
        if state.acceptance.promoted && state.acceptance.accepted == Some(key) {
            state.acceptance.promoted = false;
            true
        } else {
            false
        }
    }

    /// Trades keep no per-pair window
    fn update_capacity(&self, _pair_count: usize) {}

    fn release(&self, identity: &StreamIdentity) {
        self.state.lock().candidates.remove(&identity.key());
    }

    fn output(&self) -> &Arc<MessageBuffer> {
        &self.output
    }

    fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}
