//! Consumer-facing FIFO of accepted messages

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::{Market, StreamKind};

/// One accepted message as handed to the writer or observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    pub market: Market,
    pub kind: StreamKind,
    pub payload: String,
    /// Local receive time in epoch milliseconds
    pub received_at: i64,
}

impl QueuedMessage {
    /// Value of the combined-stream `stream` field, if the payload has one
    pub fn stream(&self) -> Option<String> {
        serde_json::from_str::<serde_json::Value>(&self.payload)
            .ok()?
            .get("stream")?
            .as_str()
            .map(str::to_owned)
    }
}

/// Thread-safe FIFO shared between producers (gating queues) and one consumer
#[derive(Debug, Default)]
pub struct MessageBuffer {
    entries: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: QueuedMessage) {
        self.entries.lock().push_back(entry);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueuedMessage> {
        self.entries.lock().pop_front()
    }

    /// Take everything currently buffered, oldest first
    pub fn drain(&self) -> Vec<QueuedMessage> {
        let mut entries = self.entries.lock();
        entries.drain(..).collect()
    }

    /// Wait up to `timeout` for the next entry
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.try_pop() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(payload: &str, received_at: i64) -> QueuedMessage {
        QueuedMessage {
            market: Market::Spot,
            kind: StreamKind::Trade,
            payload: payload.to_string(),
            received_at,
        }
    }

    #[test]
    fn test_fifo_order() {
        let buffer = MessageBuffer::new();
        buffer.push(entry("a", 1));
        buffer.push(entry("b", 2));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.try_pop().unwrap().payload, "a");
        assert_eq!(buffer.drain(), vec![entry("b", 2)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_stream_field() {
        let with_stream = entry(r#"{"stream":"btcusdt@trade","data":{}}"#, 0);
        assert_eq!(with_stream.stream().as_deref(), Some("btcusdt@trade"));
        assert_eq!(entry("not json", 0).stream(), None);
    }

    #[tokio::test]
    async fn test_pop_timeout_wakes_on_push() {
        let buffer = Arc::new(MessageBuffer::new());
        let producer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(entry("late", 5));
        });

        let popped = buffer.pop_timeout(Duration::from_secs(2)).await;
        assert_eq!(popped.map(|e| e.payload), Some("late".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_expires() {
        let buffer = MessageBuffer::new();
        assert!(buffer.pop_timeout(Duration::from_secs(1)).await.is_none());
    }
}
