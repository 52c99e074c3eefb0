//! Binance Archiver Core
//!
//! Gap-free ingestion of Binance difference depth and trade streams for the
//! spot, USD-M futures and COIN-M futures markets. Every (market, stream)
//! pair is served by one WebSocket listener that is periodically replaced by
//! a fresh one; a gating queue makes the handover invisible to consumers.

pub mod config;
pub mod daemon;
pub mod endpoints;
pub mod error;
pub mod listener;
pub mod observer;
pub mod queue;
pub mod registry;
pub mod stream_id;
pub mod supervisor;
pub mod types;
pub mod watchdog;
pub mod writer;

// Re-export main types for easy access
pub use config::{ArchiverConfig, WatchdogConfig};
pub use daemon::ArchiverDaemon;
pub use endpoints::EndpointResolver;
pub use error::{ArchiverError, ArchiverResult};
pub use listener::{ConnectionStatus, ListenerMetrics, ListenerSettings, StreamEvents, StreamListener};
pub use observer::{Observer, ObserverUpdater};
pub use queue::{
    AcceptanceState, DifferenceDepthQueue, GatingQueue, MessageBuffer, QueueStats, QueuedMessage, TradeQueue,
};
pub use registry::{QueueRegistry, DEFAULT_INSTANCE_LIMIT};
pub use stream_id::{IdentityKey, StreamIdentity};
pub use supervisor::{RotationSettings, RotationSupervisor, SupervisorState};
pub use types::{Market, QueueKey, RunMode, StreamKind};
pub use watchdog::{HealthWatchdog, StallHandler};
pub use writer::{LoggingSink, MessageSink, StreamWriter};
