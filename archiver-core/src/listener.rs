//! One Binance combined-stream WebSocket connection feeding a gating queue.
//!
//! A listener owns a stream identity, a receive task and a health watchdog.
//! Every inbound frame is stamped and offered to the bound gating queue; the
//! queue decides whether it reaches the output. Dropped connections are
//! re-established by the receive task itself, stalls are reported by the
//! watchdog through the same control channel used for subscriptions.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoints::{stream_name, EndpointResolver};
use crate::error::{ArchiverError, ArchiverResult};
use crate::queue::GatingQueue;
use crate::stream_id::StreamIdentity;
use crate::types::{now_millis, Market, StreamKind};
use crate::watchdog::{HealthWatchdog, StallHandler};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Counters kept per listener
#[derive(Debug, Clone, Default)]
pub struct ListenerMetrics {
    pub messages_received: u64,
    pub messages_routed: u64,
    pub reconnects: u64,
    pub errors: u64,
    /// Receive time of the last frame, epoch milliseconds
    pub last_message_at: Option<i64>,
}

/// Timing knobs of a listener
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub check_interval: Duration,
    pub max_silence: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            max_silence: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Socket event callbacks
pub trait StreamEvents: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, frame: &str);
    fn on_error(&self, error: &ArchiverError);
    fn on_close(&self, reason: Option<String>);
}

/// Internal control messages
#[derive(Debug)]
enum ControlMessage {
    Restart,
    Subscribe(String),
    Unsubscribe(String),
}

/// Why a socket session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Restart,
    Dropped,
    Shutdown,
}

/// State shared between the listener handle, its receive task and watchdog
struct ListenerCore {
    label: String,
    identity: StreamIdentity,
    queue: Arc<dyn GatingQueue>,
    watchdog: Arc<HealthWatchdog>,
    status: RwLock<ConnectionStatus>,
    metrics: RwLock<ListenerMetrics>,
}

impl ListenerCore {
    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }
}

impl StreamEvents for ListenerCore {
    fn on_open(&self) {
        self.set_status(ConnectionStatus::Connected);
        self.watchdog.reset();
        info!("✅ {}: connected", self.label);
    }

    fn on_message(&self, frame: &str) {
        let received_at = now_millis();
        let routed = frame.contains("\"stream\"");
        if routed {
            self.queue.put(frame, &self.identity, received_at);
        } else {
            debug!("{}: control frame {}", self.label, frame);
        }

        {
            let mut metrics = self.metrics.write();
            metrics.messages_received += 1;
            if routed {
                metrics.messages_routed += 1;
            }
            metrics.last_message_at = Some(received_at);
        }

        self.watchdog.notify();
    }

    fn on_error(&self, error: &ArchiverError) {
        self.metrics.write().errors += 1;
        if error.is_connectivity() {
            warn!("⚠️ {}: {}, will reconnect", self.label, error);
        } else {
            error!("❌ {}: {}", self.label, error);
        }
    }

    fn on_close(&self, reason: Option<String>) {
        self.set_status(ConnectionStatus::Disconnected);
        match reason {
            Some(reason) if !reason.is_empty() => info!("{}: socket closed ({})", self.label, reason),
            _ => info!("{}: socket closed", self.label),
        }
    }
}

/// Turns a watchdog stall into a restart request
struct RestartOnStall {
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl StallHandler for RestartOnStall {
    fn on_stall(&self) {
        let _ = self.control.send(ControlMessage::Restart);
    }
}

/// Handle to one live (or closed) WebSocket connection
pub struct StreamListener {
    core: Arc<ListenerCore>,
    market: Market,
    kind: StreamKind,
    endpoints: EndpointResolver,
    pairs: Arc<RwLock<Vec<String>>>,
    settings: ListenerSettings,
    control: mpsc::UnboundedSender<ControlMessage>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamListener {
    /// Build a listener; nothing is connected until `start()`.
    ///
    /// Fails on an empty pair list or an unusable endpoint.
    pub fn new(
        market: Market,
        kind: StreamKind,
        pairs: Vec<String>,
        queue: Arc<dyn GatingQueue>,
        endpoints: EndpointResolver,
        settings: ListenerSettings,
        parent: &CancellationToken,
    ) -> ArchiverResult<Self> {
        let identity = StreamIdentity::new(&pairs)?;
        endpoints.stream_url(market, kind, &pairs)?;

        let label = format!("{} {} [{}]", market, kind, identity);
        let cancel = parent.child_token();
        let watchdog = Arc::new(HealthWatchdog::new(label.clone(), cancel.child_token()));
        let (control, control_rx) = mpsc::unbounded_channel();

        Ok(Self {
            core: Arc::new(ListenerCore {
                label,
                identity,
                queue,
                watchdog,
                status: RwLock::new(ConnectionStatus::Disconnected),
                metrics: RwLock::new(ListenerMetrics::default()),
            }),
            market,
            kind,
            endpoints,
            pairs: Arc::new(RwLock::new(pairs)),
            settings,
            control,
            control_rx: Mutex::new(Some(control_rx)),
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.core.identity
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn pairs(&self) -> Vec<String> {
        self.pairs.read().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.core.status.read()
    }

    pub fn metrics(&self) -> ListenerMetrics {
        self.core.metrics.read().clone()
    }

    pub fn watchdog(&self) -> &Arc<HealthWatchdog> {
        &self.core.watchdog
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    /// Spawn the receive task and the watchdog
    pub fn start(&self) -> ArchiverResult<()> {
        let control_rx = self.control_rx.lock().take().ok_or_else(|| ArchiverError::Connection {
            message: format!("{}: listener already started", self.core.label),
        })?;

        info!("🚀 {}: starting listener", self.core.label);

        let receive = tokio::spawn(run_receive_loop(
            self.core.clone(),
            self.market,
            self.kind,
            self.endpoints.clone(),
            self.pairs.clone(),
            self.settings.clone(),
            control_rx,
            self.cancel.clone(),
        ));

        let watchdog = self.core.watchdog.clone();
        let handler: Arc<dyn StallHandler> = Arc::new(RestartOnStall {
            control: self.control.clone(),
        });
        let check_interval = self.settings.check_interval;
        let max_silence = self.settings.max_silence;
        let watch = tokio::spawn(async move {
            watchdog.run(check_interval, max_silence, handler).await;
        });

        self.tasks.lock().extend([receive, watch]);
        Ok(())
    }

    /// Drop the current socket and connect again without the reconnect delay
    pub fn restart(&self) {
        if self.control.send(ControlMessage::Restart).is_err() {
            warn!("{}: restart requested on a stopped listener", self.core.label);
        }
    }

    /// Request a graceful close and stop the watchdog; does not wait
    pub fn close(&self) {
        debug!("{}: close requested", self.core.label);
        self.core.watchdog.shutdown();
        self.cancel.cancel();
        if self.control_rx.lock().is_some() {
            // never started, nothing will flip the status
            self.core.set_status(ConnectionStatus::Closed);
        }
    }

    /// Poll until the receive task reports the socket closed
    pub async fn wait_closed(&self, wait: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while !self.is_closed() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
        true
    }

    /// Join the spawned tasks, aborting whatever is still running at `wait`
    pub async fn join(&self, wait: Duration) -> bool {
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + wait;
        let mut clean = true;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{}: task failed: {}", self.core.label, e);
                    clean = false;
                }
                Err(_) => {
                    warn!("{}: task still running after {:?}, aborting", self.core.label, wait);
                    handle.abort();
                    clean = false;
                }
            }
        }
        clean
    }

    /// Add a pair to the live connection and to later reconnects
    pub fn subscribe(&self, pair: &str) -> ArchiverResult<()> {
        let pair = pair.to_uppercase();
        let count = {
            let mut pairs = self.pairs.write();
            if pairs.contains(&pair) {
                return Ok(());
            }
            pairs.push(pair.clone());
            pairs.len()
        };

        self.core.queue.update_capacity(count);
        self.send_control(ControlMessage::Subscribe(stream_name(&pair, self.kind)));
        Ok(())
    }

    /// Remove a pair; the last pair cannot be removed
    pub fn unsubscribe(&self, pair: &str) -> ArchiverResult<()> {
        let pair = pair.to_uppercase();
        let count = {
            let mut pairs = self.pairs.write();
            let Some(index) = pairs.iter().position(|p| *p == pair) else {
                return Ok(());
            };
            if pairs.len() == 1 {
                return Err(ArchiverError::InvalidConfig(format!(
                    "cannot unsubscribe {}: a listener needs at least one pair",
                    pair
                )));
            }
            pairs.remove(index);
            pairs.len()
        };

        self.core.queue.update_capacity(count);
        self.send_control(ControlMessage::Unsubscribe(stream_name(&pair, self.kind)));
        Ok(())
    }

    fn send_control(&self, message: ControlMessage) {
        if let Err(e) = self.control.send(message) {
            debug!("{}: control channel closed: {:?}", self.core.label, e.0);
        }
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Binance live subscription frame
fn subscription_frame(method: &str, stream: &str) -> String {
    serde_json::json!({
        "method": method,
        "params": [stream],
        "id": 1
    })
    .to_string()
}

#[allow(clippy::too_many_arguments)]
async fn run_receive_loop(
    core: Arc<ListenerCore>,
    market: Market,
    kind: StreamKind,
    endpoints: EndpointResolver,
    pairs: Arc<RwLock<Vec<String>>>,
    settings: ListenerSettings,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    cancel: CancellationToken,
) {
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        core.set_status(if attempt > 0 {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        });

        let current_pairs = pairs.read().clone();
        let url = match endpoints.stream_url(market, kind, &current_pairs) {
            Ok(url) => url,
            Err(e) => {
                core.on_error(&e);
                break;
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => SessionEnd::Shutdown,
            connected = timeout(settings.connect_timeout, connect_async(url.as_str())) => match connected {
                Ok(Ok((socket, _))) => {
                    // the fresh socket already reflects these
                    while control_rx.try_recv().is_ok() {}
                    core.on_open();
                    run_session(&core, socket, &mut control_rx, &cancel, &settings).await
                }
                Ok(Err(e)) => {
                    core.on_error(&ArchiverError::from(e));
                    SessionEnd::Dropped
                }
                Err(_) => {
                    core.on_error(&ArchiverError::Timeout {
                        seconds: settings.connect_timeout.as_secs(),
                    });
                    SessionEnd::Dropped
                }
            },
        };

        match outcome {
            SessionEnd::Shutdown => break,
            SessionEnd::Restart => {
                attempt += 1;
                core.metrics.write().reconnects += 1;
                info!("🔄 {}: restarting connection", core.label);
            }
            SessionEnd::Dropped => {
                attempt += 1;
                core.metrics.write().reconnects += 1;
                core.set_status(ConnectionStatus::Disconnected);
                warn!(
                    "{}: connection lost, reconnecting in {:?}",
                    core.label, settings.reconnect_delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                }
            }
        }
    }

    core.set_status(ConnectionStatus::Closed);
    core.watchdog.shutdown();
    info!("🛑 {}: listener closed", core.label);
}

async fn run_session(
    core: &ListenerCore,
    mut socket: Socket,
    control_rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
    cancel: &CancellationToken,
    settings: &ListenerSettings,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                close_socket(core, &mut socket, settings.close_timeout).await;
                return SessionEnd::Shutdown;
            }

            control = control_rx.recv() => match control {
                Some(ControlMessage::Restart) => {
                    close_socket(core, &mut socket, settings.close_timeout).await;
                    return SessionEnd::Restart;
                }
                Some(ControlMessage::Subscribe(stream)) => {
                    if let Err(e) = socket.send(Message::Text(subscription_frame("SUBSCRIBE", &stream))).await {
                        core.on_error(&ArchiverError::from(e));
                        return SessionEnd::Dropped;
                    }
                    info!("{}: subscribed {}", core.label, stream);
                }
                Some(ControlMessage::Unsubscribe(stream)) => {
                    if let Err(e) = socket.send(Message::Text(subscription_frame("UNSUBSCRIBE", &stream))).await {
                        core.on_error(&ArchiverError::from(e));
                        return SessionEnd::Dropped;
                    }
                    info!("{}: unsubscribed {}", core.label, stream);
                }
                None => {
                    close_socket(core, &mut socket, settings.close_timeout).await;
                    return SessionEnd::Shutdown;
                }
            },

            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => core.on_message(&text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => core.on_message(&text),
                    Err(_) => core.watchdog.notify(),
                },
                Some(Ok(Message::Ping(payload))) => {
                    core.watchdog.notify();
                    if let Err(e) = socket.send(Message::Pong(payload)).await {
                        core.on_error(&ArchiverError::from(e));
                        return SessionEnd::Dropped;
                    }
                }
                Some(Ok(Message::Pong(_))) => core.watchdog.notify(),
                Some(Ok(Message::Close(frame))) => {
                    core.on_close(frame.map(|f| f.reason.to_string()));
                    return SessionEnd::Dropped;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    core.on_error(&ArchiverError::from(e));
                    return SessionEnd::Dropped;
                }
                None => {
                    core.on_close(None);
                    return SessionEnd::Dropped;
                }
            },
        }
    }
}

/// Send a close frame and wait, bounded, for the peer to confirm
async fn close_socket(core: &ListenerCore, socket: &mut Socket, wait: Duration) {
    if let Err(e) = socket.close(None).await {
        debug!("{}: close frame not sent: {}", core.label, e);
        core.on_close(None);
        return;
    }

    let confirmed = timeout(wait, async {
        while let Some(frame) = socket.next().await {
            if frame.is_err() {
                break;
            }
        }
    })
    .await;

    if confirmed.is_err() {
        warn!("{}: close not confirmed within {:?}", core.label, wait);
    }
    core.on_close(Some("closed by archiver".to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DifferenceDepthQueue, MessageBuffer, TradeQueue};

    fn pairs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn depth_listener(names: &[&str]) -> (StreamListener, Arc<dyn GatingQueue>) {
        let queue: Arc<dyn GatingQueue> =
            Arc::new(DifferenceDepthQueue::new(Market::Spot, Arc::new(MessageBuffer::new())));
        let listener = StreamListener::new(
            Market::Spot,
            StreamKind::DifferenceDepth,
            pairs(names),
            queue.clone(),
            EndpointResolver::new(),
            ListenerSettings::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        (listener, queue)
    }

    #[test]
    fn test_empty_pairs_is_fatal() {
        let queue: Arc<dyn GatingQueue> = Arc::new(TradeQueue::new(Market::Spot, Arc::new(MessageBuffer::new())));
        let result = StreamListener::new(
            Market::Spot,
            StreamKind::Trade,
            Vec::new(),
            queue,
            EndpointResolver::new(),
            ListenerSettings::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ArchiverError::InvalidIdentity)));
    }

    #[test]
    fn test_bad_endpoint_is_fatal() {
        let queue: Arc<dyn GatingQueue> = Arc::new(TradeQueue::new(Market::Spot, Arc::new(MessageBuffer::new())));
        let result = StreamListener::new(
            Market::Spot,
            StreamKind::Trade,
            pairs(&["BTCUSDT"]),
            queue,
            EndpointResolver::new().with_override(Market::Spot, "::::"),
            ListenerSettings::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ArchiverError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn test_stream_frames_are_routed() {
        let (listener, queue) = depth_listener(&["BTCUSDT"]);
        let before = listener.watchdog().silence();

        listener
            .core
            .on_message(r#"{"stream":"btcusdt@depth@100ms","data":{"E":1,"U":1,"u":1}}"#);
        listener.core.on_message(r#"{"result":null,"id":1}"#);

        assert_eq!(queue.output().len(), 1);
        let metrics = listener.metrics();
        assert_eq!(metrics.messages_received, 2);
        assert_eq!(metrics.messages_routed, 1);
        assert!(metrics.last_message_at.is_some());
        assert!(listener.watchdog().silence() <= before);
    }

    #[tokio::test]
    async fn test_subscribe_updates_pairs() {
        let (listener, _queue) = depth_listener(&["BTCUSDT"]);

        listener.subscribe("ethusdt").unwrap();
        listener.subscribe("ETHUSDT").unwrap();
        assert_eq!(listener.pairs(), pairs(&["BTCUSDT", "ETHUSDT"]));

        listener.unsubscribe("BTCUSDT").unwrap();
        assert_eq!(listener.pairs(), pairs(&["ETHUSDT"]));

        let last = listener.unsubscribe("ETHUSDT");
        assert!(matches!(last, Err(ArchiverError::InvalidConfig(_))));
        assert_eq!(listener.pairs(), pairs(&["ETHUSDT"]));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let (listener, _queue) = depth_listener(&["BTCUSDT"]);
        assert_eq!(listener.status(), ConnectionStatus::Disconnected);
        listener.close();
        assert!(listener.is_closed());
        assert!(listener.join(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (listener, _queue) = depth_listener(&["BTCUSDT"]);
        listener.close();
        listener.start().unwrap();
        assert!(listener.start().is_err());
        assert!(listener.wait_closed(Duration::from_secs(2), Duration::from_millis(10)).await);
        assert!(listener.join(Duration::from_secs(2)).await);
    }

    #[test]
    fn test_subscription_frame() {
        let frame: serde_json::Value =
            serde_json::from_str(&subscription_frame("SUBSCRIBE", "btcusdt@trade")).unwrap();
        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["params"][0], "btcusdt@trade");
        assert_eq!(frame["id"], 1);
    }
}
