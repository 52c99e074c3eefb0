//! Fan-out of the shared listener-mode buffer to registered observers

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::{MessageBuffer, QueuedMessage};

/// Backlog size above which the updater starts warning
pub const BACKLOG_WARNING: usize = 200;

pub trait Observer: Send + Sync {
    fn update(&self, message: &QueuedMessage);
}

pub struct ObserverUpdater {
    buffer: Arc<MessageBuffer>,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    pop_timeout: Duration,
}

impl ObserverUpdater {
    pub fn new(buffer: Arc<MessageBuffer>) -> Self {
        Self {
            buffer,
            observers: RwLock::new(Vec::new()),
            pop_timeout: Duration::from_secs(1),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("👀 Observer updater started with {} observers", self.observer_count());
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = self.buffer.pop_timeout(self.pop_timeout) => entry,
            };
            let Some(entry) = entry else {
                continue;
            };

            let backlog = self.buffer.len();
            if backlog > BACKLOG_WARNING {
                warn!("⚠️ Observer backlog at {} messages", backlog);
            }

            let observers = self.observers.read().clone();
            for observer in &observers {
                observer.update(&entry);
            }
        }
        info!("Observer updater stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Market, StreamKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<i64>>,
    }

    impl Observer for Collector {
        fn update(&self, message: &QueuedMessage) {
            self.seen.lock().push(message.received_at);
        }
    }

    fn message(received_at: i64) -> QueuedMessage {
        QueuedMessage {
            market: Market::CoinMFutures,
            kind: StreamKind::DifferenceDepth,
            payload: "{}".to_string(),
            received_at,
        }
    }

    #[tokio::test]
    async fn test_every_observer_sees_every_message() {
        let buffer = Arc::new(MessageBuffer::new());
        let updater = Arc::new(ObserverUpdater::new(buffer.clone()));
        let first = Arc::new(Collector::default());
        let second = Arc::new(Collector::default());
        updater.add_observer(first.clone());
        updater.add_observer(second.clone());

        for i in 0..5 {
            buffer.push(message(i));
        }

        let cancel = CancellationToken::new();
        let runner = updater.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.run(token).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while second.seen.lock().len() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*first.seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*second.seen.lock(), vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_updater_stops_on_cancel() {
        let updater = Arc::new(ObserverUpdater::new(Arc::new(MessageBuffer::new())));
        let cancel = CancellationToken::new();
        let runner = updater.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.run(token).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
