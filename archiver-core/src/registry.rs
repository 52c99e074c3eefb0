//! Owner of the gating queues, one per (market, stream kind).
//!
//! Queue construction goes through the registry so the per-class instance
//! cap holds for the whole process.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ArchiverError, ArchiverResult};
use crate::queue::{DifferenceDepthQueue, GatingQueue, MessageBuffer, TradeQueue};
use crate::types::{Market, QueueKey, RunMode, StreamKind};

/// Default number of live instances allowed per queue class
pub const DEFAULT_INSTANCE_LIMIT: usize = 4;

fn class_name(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::DifferenceDepth => "DifferenceDepthQueue",
        StreamKind::Trade => "TradeQueue",
    }
}

pub struct QueueRegistry {
    limit: usize,
    run_mode: RunMode,
    instances: Mutex<HashMap<StreamKind, usize>>,
    queues: DashMap<QueueKey, Arc<dyn GatingQueue>>,
    fan_in: Option<Arc<MessageBuffer>>,
}

impl QueueRegistry {
    pub fn new(limit: usize, run_mode: RunMode) -> Self {
        let fan_in = match run_mode {
            RunMode::Listener => Some(Arc::new(MessageBuffer::new())),
            RunMode::DataSink => None,
        };
        Self {
            limit,
            run_mode,
            instances: Mutex::new(HashMap::new()),
            queues: DashMap::new(),
            fan_in,
        }
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Shared output of every queue in listener mode
    pub fn fan_in(&self) -> Option<Arc<MessageBuffer>> {
        self.fan_in.clone()
    }

    pub fn instance_count(&self, kind: StreamKind) -> usize {
        self.instances.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn create_difference_depth_queue(&self, market: Market) -> ArchiverResult<Arc<DifferenceDepthQueue>> {
        self.reserve(StreamKind::DifferenceDepth)?;
        let queue = Arc::new(DifferenceDepthQueue::new(market, self.output_buffer()));
        self.bind(queue.clone());
        Ok(queue)
    }

    pub fn create_trade_queue(&self, market: Market) -> ArchiverResult<Arc<TradeQueue>> {
        self.reserve(StreamKind::Trade)?;
        let queue = Arc::new(TradeQueue::new(market, self.output_buffer()));
        self.bind(queue.clone());
        Ok(queue)
    }

    /// Create both queues of every given market
    pub fn bootstrap(&self, markets: &[Market]) -> ArchiverResult<()> {
        for market in markets {
            self.create_difference_depth_queue(*market)?;
            self.create_trade_queue(*market)?;
        }
        info!("📦 Registered {} gating queues ({:?} mode)", self.queues.len(), self.run_mode);
        Ok(())
    }

    pub fn lookup(&self, market: Market, kind: StreamKind) -> ArchiverResult<Arc<dyn GatingQueue>> {
        self.queues
            .get(&QueueKey::new(market, kind))
            .map(|entry| entry.value().clone())
            .ok_or(ArchiverError::QueueNotFound { market, kind })
    }

    /// Registered queues ordered by key
    pub fn queues(&self) -> Vec<Arc<dyn GatingQueue>> {
        let mut queues: Vec<_> = self.queues.iter().map(|entry| entry.value().clone()).collect();
        queues.sort_by_key(|queue| queue.key());
        queues
    }

    /// Unregister a queue and free its instance slot
    pub fn release(&self, market: Market, kind: StreamKind) -> bool {
        if self.queues.remove(&QueueKey::new(market, kind)).is_none() {
            return false;
        }
        let mut instances = self.instances.lock();
        if let Some(count) = instances.get_mut(&kind) {
            *count = count.saturating_sub(1);
        }
        true
    }

    fn reserve(&self, kind: StreamKind) -> ArchiverResult<()> {
        let mut instances = self.instances.lock();
        let count = instances.entry(kind).or_insert(0);
        if *count >= self.limit {
            return Err(ArchiverError::InstanceLimitExceeded {
                class: class_name(kind),
                limit: self.limit,
            });
        }
        *count += 1;
        Ok(())
    }

    fn output_buffer(&self) -> Arc<MessageBuffer> {
        self.fan_in.clone().unwrap_or_else(|| Arc::new(MessageBuffer::new()))
    }

    fn bind(&self, queue: Arc<dyn GatingQueue>) {
        let key = queue.key();
        if self.queues.insert(key, queue).is_some() {
            warn!("{}: replacing previously registered queue", key);
        }
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_INSTANCE_LIMIT, RunMode::default())
    }
}
