//! Binance combined-stream endpoint resolution

use std::collections::HashMap;
use url::Url;

use crate::error::{ArchiverError, ArchiverResult};
use crate::types::{Market, StreamKind};

/// Default combined-stream base URL for a market
pub fn default_stream_base(market: Market) -> &'static str {
    match market {
        Market::Spot => "wss://stream.binance.com:443/stream",
        Market::UsdMFutures => "wss://fstream.binance.com/stream",
        Market::CoinMFutures => "wss://dstream.binance.com/stream",
    }
}

/// Stream name for one pair, e.g. `btcusdt@depth@100ms`
pub fn stream_name(pair: &str, kind: StreamKind) -> String {
    format!("{}{}", pair.to_lowercase(), kind.stream_suffix())
}

/// Resolves the WebSocket URL for a (market, stream kind, pairs) triple
#[derive(Debug, Clone, Default)]
pub struct EndpointResolver {
    overrides: HashMap<Market, String>,
}

impl EndpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `base_url` instead of the public Binance host for `market`
    pub fn with_override(mut self, market: Market, base_url: impl Into<String>) -> Self {
        self.overrides.insert(market, base_url.into());
        self
    }

    pub fn base_url(&self, market: Market) -> &str {
        self.overrides
            .get(&market)
            .map(String::as_str)
            .unwrap_or_else(|| default_stream_base(market))
    }

    /// Build the combined-stream URL subscribing to every pair at once
    pub fn stream_url(&self, market: Market, kind: StreamKind, pairs: &[String]) -> ArchiverResult<Url> {
        if pairs.is_empty() {
            return Err(ArchiverError::InvalidEndpoint {
                details: format!("no pairs given for {} {}", market, kind),
            });
        }

        let streams = pairs
            .iter()
            .map(|pair| stream_name(pair, kind))
            .collect::<Vec<_>>()
            .join("/");

        let mut url = Url::parse(self.base_url(market))?;
        // Binance expects the raw `/`-joined list, so no percent-encoding
        url.set_query(Some(&format!("streams={}", streams)));
        Ok(url)
    }
}
