//! Gating queues deciding which listener's frames reach the output.
//!
//! Every (market, stream kind) pair has one gating queue. During a rotation
//! two listeners feed the same queue; only the accepted one is forwarded,
//! the retired one is dropped, and the queue decides when the newer
//! listener takes over.

pub mod buffer;
pub mod comparison;
pub mod difference_depth;
pub mod trade;

use std::sync::Arc;

use crate::stream_id::{IdentityKey, StreamIdentity};
use crate::types::{Market, QueueKey, StreamKind};

pub use buffer::{MessageBuffer, QueuedMessage};
pub use difference_depth::DifferenceDepthQueue;
pub use trade::TradeQueue;

/// Which producer is forwarded and which is silenced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcceptanceState {
    pub accepted: Option<IdentityKey>,
    pub retired: Option<IdentityKey>,
    /// Set on every switch of `accepted`, cleared once the supervisor consumes it
    pub promoted: bool,
}

/// Counters kept by every gating queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub promotions: u64,
}

/// Shared behaviour of the difference depth and trade queues.
///
/// Implementations serialize all state changes behind one lock; the output
/// buffer is only touched while that lock is held so the forwarded order is
/// the order in which `put` calls were admitted.
pub trait GatingQueue: Send + Sync + std::fmt::Debug {
    fn key(&self) -> QueueKey;

    fn market(&self) -> Market {
        self.key().market
    }

    fn kind(&self) -> StreamKind {
        self.key().kind
    }

    /// Offer one raw frame received by `producer` at `received_at` (epoch ms)
    fn put(&self, message: &str, producer: &StreamIdentity, received_at: i64);

    /// Make `identity` the accepted producer if none is accepted yet.
    ///
    /// Returns false when another producer already holds the slot.
    fn accept(&self, identity: &StreamIdentity) -> bool;

    fn acceptance(&self) -> AcceptanceState;

    /// Read and clear the promotion flag
    fn take_promotion(&self) -> bool;

    /// Check whether `candidate` has taken over and consume the promotion.
    ///
    /// Called periodically by the rotation supervisor while two listeners
    /// overlap; true means the incumbent can be closed.
    fn try_complete_handover(&self, candidate: &StreamIdentity) -> bool;

    /// Resize comparison state after the subscribed pair set changed
    fn update_capacity(&self, pair_count: usize);

    /// Forget per-producer state of a listener that has been closed
    fn release(&self, identity: &StreamIdentity);

    fn output(&self) -> &Arc<MessageBuffer>;

    fn stats(&self) -> QueueStats;
}
