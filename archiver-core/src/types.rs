//! Market and stream data types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binance market segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Spot,
    UsdMFutures,
    CoinMFutures,
}

impl Market {
    pub const ALL: [Market; 3] = [Market::Spot, Market::UsdMFutures, Market::CoinMFutures];

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::UsdMFutures => "usd_m_futures",
            Market::CoinMFutures => "coin_m_futures",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of WebSocket stream a listener subscribes to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    DifferenceDepth,
    Trade,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::DifferenceDepth, StreamKind::Trade];

    /// Suffix appended to a lowercase pair to form the Binance stream name
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            StreamKind::DifferenceDepth => "@depth@100ms",
            StreamKind::Trade => "@trade",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::DifferenceDepth => "difference_depth",
            StreamKind::Trade => "trade",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deployment mode deciding where accepted messages end up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every queue owns its output buffer, drained by its own writer
    #[default]
    DataSink,
    /// Every queue feeds one shared fan-in buffer consumed by observers
    Listener,
}

/// Registry key: one gating queue per market and stream kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub market: Market,
    pub kind: StreamKind,
}

impl QueueKey {
    pub fn new(market: Market, kind: StreamKind) -> Self {
        Self { market, kind }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.market, self.kind)
    }
}

/// Current UTC time in epoch milliseconds, rounded like the receive stamps
/// written next to every archived message
pub fn now_millis() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_millis() + i64::from(now.timestamp_subsec_micros() % 1000 >= 500)
}

/// Current UTC time in epoch nanoseconds
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
