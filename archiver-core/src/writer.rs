//! Periodic drain of a queue's output into a message sink

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ArchiverResult;
use crate::queue::{MessageBuffer, QueuedMessage};
use crate::types::QueueKey;

/// Destination of drained batches, one call per stream name
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn write_batch(&self, key: QueueKey, stream: &str, batch: Vec<QueuedMessage>) -> ArchiverResult<()>;
}

/// Sink that only reports batch sizes
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl MessageSink for LoggingSink {
    async fn write_batch(&self, key: QueueKey, stream: &str, batch: Vec<QueuedMessage>) -> ArchiverResult<()> {
        let first = batch.first().map(|m| m.received_at).unwrap_or_default();
        let last = batch.last().map(|m| m.received_at).unwrap_or_default();
        info!(
            "💾 {} {}: {} messages ({} .. {})",
            key,
            stream,
            batch.len(),
            first,
            last
        );
        Ok(())
    }
}

/// Writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub flushes: u64,
    pub messages: u64,
    pub failed_batches: u64,
}

pub struct StreamWriter {
    key: QueueKey,
    buffer: Arc<MessageBuffer>,
    sink: Arc<dyn MessageSink>,
    flush_interval: Duration,
    flushes: AtomicU64,
    messages: AtomicU64,
    failed_batches: AtomicU64,
}

impl StreamWriter {
    pub fn new(key: QueueKey, buffer: Arc<MessageBuffer>, sink: Arc<dyn MessageSink>, flush_interval: Duration) -> Self {
        Self {
            key,
            buffer,
            sink,
            flush_interval,
            flushes: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Flush every interval; a last flush runs after cancellation
    pub async fn run(&self, cancel: CancellationToken) {
        debug!("{}: writer started, flushing every {:?}", self.key, self.flush_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.flush_interval) => {
                    self.flush().await;
                }
            }
        }
        let remaining = self.flush().await;
        info!("{}: writer stopped after final flush of {} messages", self.key, remaining);
    }

    /// Drain the buffer and hand each stream's messages to the sink
    pub async fn flush(&self) -> usize {
        let drained = self.buffer.drain();
        if drained.is_empty() {
            return 0;
        }
        let total = drained.len();

        let mut by_stream: BTreeMap<String, Vec<QueuedMessage>> = BTreeMap::new();
        for message in drained {
            let stream = message.stream().unwrap_or_else(|| "unknown".to_string());
            by_stream.entry(stream).or_default().push(message);
        }

        for (stream, batch) in by_stream {
            if let Err(e) = self.sink.write_batch(self.key, &stream, batch).await {
                error!("❌ {} {}: failed to write batch: {}", self.key, stream, e);
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(total as u64, Ordering::Relaxed);
        total
    }
}
