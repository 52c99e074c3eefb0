//! Archiver configuration loaded from JSON

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::error;

use crate::endpoints::EndpointResolver;
use crate::error::{ArchiverError, ArchiverResult};
use crate::listener::ListenerSettings;
use crate::registry::DEFAULT_INSTANCE_LIMIT;
use crate::supervisor::RotationSettings;
use crate::types::{Market, RunMode};

/// Shortest and longest allowed listener lifetime in seconds
pub const MIN_WEBSOCKET_LIFE_TIME_SECONDS: u64 = 60;
pub const MAX_WEBSOCKET_LIFE_TIME_SECONDS: u64 = 60 * 60 * 23;

/// Watchdog timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_seconds: u64,
    pub max_silence_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 5,
            max_silence_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Pairs per market
    pub instruments: BTreeMap<Market, Vec<String>>,
    pub websocket_life_time_seconds: u64,
    pub file_duration_seconds: u64,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default = "default_instance_limit")]
    pub max_queue_instances_per_class: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// WebSocket base URL overrides per market
    #[serde(default)]
    pub endpoints: BTreeMap<Market, String>,
}

fn default_instance_limit() -> usize {
    DEFAULT_INSTANCE_LIMIT
}

fn default_shutdown_grace() -> u64 {
    10
}

impl ArchiverConfig {
    pub fn from_json_str(json: &str) -> ArchiverResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ArchiverResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            error!("❌ Cannot read config {}: {}", path.display(), e);
            ArchiverError::from(e)
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> ArchiverResult<()> {
        if self.instruments.is_empty() || self.instruments.len() > Market::ALL.len() {
            return Err(ArchiverError::InvalidConfig(format!(
                "instruments must name 1 to {} markets, got {}",
                Market::ALL.len(),
                self.instruments.len()
            )));
        }

        if let Some((market, _)) = self.instruments.iter().find(|(_, pairs)| pairs.is_empty()) {
            return Err(ArchiverError::InvalidConfig(format!("pair list for {} is empty", market)));
        }

        if !(MIN_WEBSOCKET_LIFE_TIME_SECONDS..=MAX_WEBSOCKET_LIFE_TIME_SECONDS)
            .contains(&self.websocket_life_time_seconds)
        {
            return Err(ArchiverError::InvalidConfig(format!(
                "websocket_life_time_seconds must be within {}..={}, got {}",
                MIN_WEBSOCKET_LIFE_TIME_SECONDS, MAX_WEBSOCKET_LIFE_TIME_SECONDS, self.websocket_life_time_seconds
            )));
        }

        if self.file_duration_seconds == 0 {
            return Err(ArchiverError::InvalidConfig(
                "file_duration_seconds must be positive".to_string(),
            ));
        }

        if self.watchdog.check_interval_seconds == 0 || self.watchdog.max_silence_seconds == 0 {
            return Err(ArchiverError::InvalidConfig(
                "watchdog intervals must be positive".to_string(),
            ));
        }

        if self.max_queue_instances_per_class == 0 {
            return Err(ArchiverError::InvalidConfig(
                "max_queue_instances_per_class must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Configured markets in stable order
    pub fn markets(&self) -> Vec<Market> {
        self.instruments.keys().copied().collect()
    }

    /// Upper-cased pair list of a market
    pub fn pairs(&self, market: Market) -> Vec<String> {
        self.instruments
            .get(&market)
            .map(|pairs| pairs.iter().map(|p| p.to_uppercase()).collect())
            .unwrap_or_default()
    }

    pub fn file_duration(&self) -> Duration {
        Duration::from_secs(self.file_duration_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn endpoint_resolver(&self) -> EndpointResolver {
        self.endpoints
            .iter()
            .fold(EndpointResolver::new(), |resolver, (market, url)| {
                resolver.with_override(*market, url.clone())
            })
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            check_interval: Duration::from_secs(self.watchdog.check_interval_seconds),
            max_silence: Duration::from_secs(self.watchdog.max_silence_seconds),
            ..ListenerSettings::default()
        }
    }

    pub fn rotation_settings(&self) -> RotationSettings {
        RotationSettings {
            rotation_period: Duration::from_secs(self.websocket_life_time_seconds),
            listener: self.listener_settings(),
            ..RotationSettings::default()
        }
    }
}
