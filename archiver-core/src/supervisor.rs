//! Periodic listener rotation for one (market, stream kind).
//!
//! Binance drops every connection after 24 hours. Before that happens the
//! supervisor opens a second listener on the same pairs, waits for the gating
//! queue to accept it and only then closes the old one, so the output never
//! has a gap or a duplicate at the switch.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::endpoints::EndpointResolver;
use crate::error::{ArchiverError, ArchiverResult};
use crate::listener::{ListenerSettings, StreamListener};
use crate::queue::GatingQueue;
use crate::types::{Market, StreamKind};

/// Lifecycle of a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    RunningSingle,
    Rotating,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct RotationSettings {
    /// Lifetime of a listener before it is replaced
    pub rotation_period: Duration,
    /// How often the queue is asked whether the candidate took over
    pub handover_poll: Duration,
    /// Bound on waiting for a closed listener to confirm
    pub close_wait: Duration,
    pub close_poll: Duration,
    pub join_wait: Duration,
    pub listener: ListenerSettings,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            rotation_period: Duration::from_secs(60 * 60 * 6),
            handover_poll: Duration::from_secs(1),
            close_wait: Duration::from_secs(10),
            close_poll: Duration::from_millis(100),
            join_wait: Duration::from_secs(5),
            listener: ListenerSettings::default(),
        }
    }
}

pub struct RotationSupervisor {
    label: String,
    market: Market,
    kind: StreamKind,
    queue: Arc<dyn GatingQueue>,
    endpoints: EndpointResolver,
    pairs: RwLock<Vec<String>>,
    settings: RotationSettings,
    state: RwLock<SupervisorState>,
    incumbent: Mutex<Option<Arc<StreamListener>>>,
    candidate: Mutex<Option<Arc<StreamListener>>>,
    rotations: AtomicU64,
    cancel: CancellationToken,
}

impl RotationSupervisor {
    pub fn new(
        queue: Arc<dyn GatingQueue>,
        pairs: Vec<String>,
        endpoints: EndpointResolver,
        settings: RotationSettings,
        cancel: CancellationToken,
    ) -> ArchiverResult<Self> {
        if pairs.is_empty() {
            return Err(ArchiverError::InvalidIdentity);
        }
        let key = queue.key();

        Ok(Self {
            label: key.to_string(),
            market: key.market,
            kind: key.kind,
            queue,
            endpoints,
            pairs: RwLock::new(pairs),
            settings,
            state: RwLock::new(SupervisorState::RunningSingle),
            incumbent: Mutex::new(None),
            candidate: Mutex::new(None),
            rotations: AtomicU64::new(0),
            cancel,
        })
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.read()
    }

    /// Completed handovers
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn incumbent(&self) -> Option<Arc<StreamListener>> {
        self.incumbent.lock().clone()
    }

    pub fn pairs(&self) -> Vec<String> {
        self.pairs.read().clone()
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.write() = state;
    }

    /// Build a listener from the current pair list and publish it in `slot`.
    ///
    /// The pair list stays read-locked until the listener is visible, so a
    /// concurrent `subscribe` either lands in the new listener's pairs or
    /// finds the listener among the live ones.
    fn stage_listener(&self, slot: &Mutex<Option<Arc<StreamListener>>>) -> ArchiverResult<Arc<StreamListener>> {
        let pairs = self.pairs.read();
        let listener = Arc::new(self.build_listener(pairs.clone())?);
        *slot.lock() = Some(listener.clone());
        Ok(listener)
    }

    fn build_listener(&self, pairs: Vec<String>) -> ArchiverResult<StreamListener> {
        StreamListener::new(
            self.market,
            self.kind,
            pairs,
            self.queue.clone(),
            self.endpoints.clone(),
            self.settings.listener.clone(),
            &self.cancel,
        )
    }

    /// Run until the cancellation token fires.
    ///
    /// Fails only when the first listener cannot be built.
    pub async fn run(self: Arc<Self>) -> ArchiverResult<()> {
        let first = self.stage_listener(&self.incumbent)?;
        if !self.queue.accept(first.identity()) {
            warn!("{}: queue already has an accepted producer", self.label);
        }
        first.start()?;
        self.set_state(SupervisorState::RunningSingle);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.rotation_period) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.rotate().await {
                error!("❌ {}: rotation failed, keeping current listener: {}", self.label, e);
                self.set_state(SupervisorState::RunningSingle);
            }
        }

        self.shutdown_listeners().await;
        Ok(())
    }

    async fn rotate(&self) -> ArchiverResult<()> {
        self.set_state(SupervisorState::Rotating);

        let candidate = self.stage_listener(&self.candidate)?;
        if let Err(e) = candidate.start() {
            self.candidate.lock().take();
            return Err(e);
        }
        info!("🔄 {}: rotating to {}", self.label, candidate.identity());

        // TODO: bound this wait and retry with a fresh candidate when it never takes over
        loop {
            if self.queue.try_complete_handover(candidate.identity()) {
                break;
            }
            tokio::select! {
                // both listeners are closed by shutdown_listeners
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.settings.handover_poll) => {}
            }
        }

        let previous = self.incumbent.lock().replace(candidate);
        self.candidate.lock().take();
        if let Some(previous) = previous {
            self.retire(previous).await;
        }

        self.rotations.fetch_add(1, Ordering::Relaxed);
        self.set_state(SupervisorState::RunningSingle);
        info!("✅ {}: rotation complete", self.label);
        Ok(())
    }

    async fn retire(&self, listener: Arc<StreamListener>) {
        listener.close();
        if !listener
            .wait_closed(self.settings.close_wait, self.settings.close_poll)
            .await
        {
            warn!(
                "{}: listener {} not closed after {:?}, continuing",
                self.label,
                listener.identity(),
                self.settings.close_wait
            );
        }
        listener.join(self.settings.join_wait).await;
        self.queue.release(listener.identity());
    }

    async fn shutdown_listeners(&self) {
        self.set_state(SupervisorState::ShuttingDown);
        let live: Vec<_> = [self.incumbent.lock().take(), self.candidate.lock().take()]
            .into_iter()
            .flatten()
            .collect();

        for listener in &live {
            listener.close();
        }
        for listener in live {
            self.retire(listener).await;
        }
        info!("🛑 {}: supervisor stopped", self.label);
    }

    /// Add a pair to the running listeners and to future candidates
    pub fn subscribe(&self, pair: &str) -> ArchiverResult<()> {
        let pair = pair.to_uppercase();
        {
            let mut pairs = self.pairs.write();
            if !pairs.contains(&pair) {
                pairs.push(pair.clone());
            }
        }
        for listener in self.live_listeners() {
            listener.subscribe(&pair)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, pair: &str) -> ArchiverResult<()> {
        let pair = pair.to_uppercase();
        {
            let mut pairs = self.pairs.write();
            if pairs.len() == 1 && pairs.contains(&pair) {
                return Err(ArchiverError::InvalidConfig(format!(
                    "cannot unsubscribe {}: {} needs at least one pair",
                    pair, self.label
                )));
            }
            pairs.retain(|p| *p != pair);
        }
        for listener in self.live_listeners() {
            listener.unsubscribe(&pair)?;
        }
        Ok(())
    }

    fn live_listeners(&self) -> Vec<Arc<StreamListener>> {
        [self.incumbent.lock().clone(), self.candidate.lock().clone()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MessageBuffer, TradeQueue};

    fn trade_queue() -> Arc<dyn GatingQueue> {
        Arc::new(TradeQueue::new(Market::Spot, Arc::new(MessageBuffer::new())))
    }

    fn unreachable_endpoints() -> EndpointResolver {
        EndpointResolver::new().with_override(Market::Spot, "ws://127.0.0.1:9/stream")
    }

    #[test]
    fn test_empty_pairs_rejected() {
        let result = RotationSupervisor::new(
            trade_queue(),
            Vec::new(),
            EndpointResolver::new(),
            RotationSettings::default(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(ArchiverError::InvalidIdentity)));
    }

    #[test]
    fn test_pairs_edited_without_listeners() {
        let supervisor = RotationSupervisor::new(
            trade_queue(),
            vec!["BTCUSDT".to_string()],
            EndpointResolver::new(),
            RotationSettings::default(),
            CancellationToken::new(),
        )
        .unwrap();

        supervisor.subscribe("ethusdt").unwrap();
        assert_eq!(supervisor.pairs(), vec!["BTCUSDT", "ETHUSDT"]);
        supervisor.unsubscribe("BTCUSDT").unwrap();
        assert!(supervisor.unsubscribe("ETHUSDT").is_err());
        assert_eq!(supervisor.pairs(), vec!["ETHUSDT"]);
    }

    #[test]
    fn test_staged_listener_sees_concurrent_subscribe() {
        let supervisor = Arc::new(
            RotationSupervisor::new(
                trade_queue(),
                vec!["BTCUSDT".to_string()],
                EndpointResolver::new(),
                RotationSettings::default(),
                CancellationToken::new(),
            )
            .unwrap(),
        );

        let subscriber = {
            let supervisor = supervisor.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    supervisor.subscribe(&format!("PAIR{}USDT", i)).unwrap();
                }
            })
        };
        let staged = supervisor.stage_listener(&supervisor.candidate).unwrap();
        subscriber.join().unwrap();

        let mut expected = supervisor.pairs();
        let mut actual = staged.pairs();
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
        assert_eq!(actual.len(), 201);
    }

    #[tokio::test]
    async fn test_cancelled_run_closes_listener() {
        let cancel = CancellationToken::new();
        let queue = trade_queue();
        let supervisor = Arc::new(
            RotationSupervisor::new(
                queue.clone(),
                vec!["BTCUSDT".to_string()],
                unreachable_endpoints(),
                RotationSettings {
                    close_wait: Duration::from_secs(2),
                    ..RotationSettings::default()
                },
                cancel.clone(),
            )
            .unwrap(),
        );

        let task = tokio::spawn(supervisor.clone().run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.acceptance().accepted.is_some());

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::ShuttingDown);
        assert_eq!(supervisor.rotations(), 0);
        assert!(supervisor.incumbent().is_none());
    }
}
