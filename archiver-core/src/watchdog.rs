//! Silence detection for a single listener connection

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reaction to a connection that went silent
pub trait StallHandler: Send + Sync {
    fn on_stall(&self);
}

impl<F> StallHandler for F
where
    F: Fn() + Send + Sync,
{
    fn on_stall(&self) {
        self()
    }
}

/// Tracks the last inbound frame and fires a handler once per stall episode.
///
/// A stall episode starts when no frame was seen for longer than
/// `max_silence` and ends at the next `notify()` or `reset()`.
pub struct HealthWatchdog {
    label: String,
    last_seen: Mutex<Instant>,
    stalled: AtomicBool,
    running: AtomicBool,
    stalls: AtomicU64,
    stop: CancellationToken,
}

impl HealthWatchdog {
    pub fn new(label: impl Into<String>, stop: CancellationToken) -> Self {
        Self {
            label: label.into(),
            last_seen: Mutex::new(Instant::now()),
            stalled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stalls: AtomicU64::new(0),
            stop,
        }
    }

    /// Record liveness; called for every inbound frame
    pub fn notify(&self) {
        *self.last_seen.lock() = Instant::now();
        self.stalled.store(false, Ordering::Release);
    }

    /// Start a fresh observation window after (re)connecting
    pub fn reset(&self) {
        self.notify();
    }

    pub fn silence(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Number of stall episodes detected so far
    pub fn stall_count(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Poll every `check_interval` until `shutdown()` is called
    pub async fn run(&self, check_interval: Duration, max_silence: Duration, handler: Arc<dyn StallHandler>) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("{}: watchdog already running", self.label);
            return;
        }
        debug!("{}: watchdog started", self.label);

        let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let silence = self.silence();
            if silence > max_silence && !self.stalled.swap(true, Ordering::AcqRel) {
                warn!(
                    "⚠️ {}: no data for {:.1}s, requesting restart",
                    self.label,
                    silence.as_secs_f64()
                );
                self.stalls.fetch_add(1, Ordering::Relaxed);
                handler.on_stall();
            }
        }

        self.running.store(false, Ordering::Release);
        debug!("{}: watchdog stopped", self.label);
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler() -> (Arc<AtomicUsize>, Arc<dyn StallHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler: Arc<dyn StallHandler> = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_stall_episode() {
        let watchdog = Arc::new(HealthWatchdog::new("spot trade", CancellationToken::new()));
        let (count, handler) = counting_handler();

        let runner = watchdog.clone();
        let task = tokio::spawn(async move {
            runner
                .run(Duration::from_secs(1), Duration::from_secs(3), handler)
                .await
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(watchdog.is_stalled());

        watchdog.notify();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(watchdog.stall_count(), 2);

        watchdog.shutdown();
        task.await.unwrap();
        assert!(!watchdog.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_traffic_never_fires() {
        let watchdog = Arc::new(HealthWatchdog::new("spot difference_depth", CancellationToken::new()));
        let (count, handler) = counting_handler();

        let runner = watchdog.clone();
        let task = tokio::spawn(async move {
            runner
                .run(Duration::from_secs(1), Duration::from_secs(3), handler)
                .await
        });

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            watchdog.notify();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        watchdog.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_rejected() {
        let watchdog = Arc::new(HealthWatchdog::new("coin_m_futures trade", CancellationToken::new()));
        let (_, handler) = counting_handler();

        let runner = watchdog.clone();
        let first_handler = handler.clone();
        let task = tokio::spawn(async move {
            runner
                .run(Duration::from_secs(1), Duration::from_secs(3), first_handler)
                .await
        });
        while !watchdog.is_running() {
            tokio::task::yield_now().await;
        }

        // returns immediately instead of starting a second loop
        watchdog
            .run(Duration::from_secs(1), Duration::from_secs(3), handler)
            .await;

        watchdog.shutdown();
        task.await.unwrap();
    }
}
