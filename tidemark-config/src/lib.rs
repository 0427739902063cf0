//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub replica: ReplicaChecksConfig,
    #[serde(default)]
    pub transport: TransportTimingConfig,
    #[serde(default)]
    pub session: SessionTimingConfig,
    #[serde(default)]
    pub venue: HashMap<String, VenueConfig>,
    #[serde(default)]
    pub bridge: Option<BridgeEndpointConfig>,
}

/// Cadence of the per-replica consistency checks.
#[derive(Debug, Deserialize, Clone)]
pub struct ReplicaChecksConfig {
    #[serde(default = "default_frozen_check_interval_ms")]
    pub frozen_check_interval_ms: u64,
    #[serde(default = "default_price_overlaps_check_interval_ms")]
    pub price_overlaps_check_interval_ms: u64,
    #[serde(default = "default_staleness_depth")]
    pub staleness_depth: usize,
}

impl ReplicaChecksConfig {
    #[must_use]
    pub fn frozen_check_interval(&self) -> Duration {
        Duration::from_millis(self.frozen_check_interval_ms)
    }

    #[must_use]
    pub fn price_overlaps_check_interval(&self) -> Duration {
        Duration::from_millis(self.price_overlaps_check_interval_ms)
    }
}

/// Heartbeat and fault-window knobs for each transport.
#[derive(Debug, Deserialize, Clone)]
pub struct TransportTimingConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_fault_window_secs")]
    pub fault_window_secs: u64,
    #[serde(default = "default_fault_limit")]
    pub fault_limit: u32,
}

impl TransportTimingConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    #[must_use]
    pub fn fault_window(&self) -> Duration {
        Duration::from_secs(self.fault_window_secs)
    }
}

/// Handshake deadlines and reconnect pacing for each controller.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionTimingConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: bool,
}

impl SessionTimingConfig {
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    #[must_use]
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// Endpoints and credentials for one venue, plus freeform adapter params.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct VenueConfig {
    pub ws_url: String,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_venue_driver_name")]
    pub driver: String,
    #[serde(default, flatten)]
    pub params: Value,
}

/// Listening endpoint for the distribution bridge.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeEndpointConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    #[serde(default = "default_bridge_depth")]
    pub depth: usize,
}

impl BridgeEndpointConfig {
    #[must_use]
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }
}

impl Default for ReplicaChecksConfig {
    fn default() -> Self {
        Self {
            frozen_check_interval_ms: default_frozen_check_interval_ms(),
            price_overlaps_check_interval_ms: default_price_overlaps_check_interval_ms(),
            staleness_depth: default_staleness_depth(),
        }
    }
}

impl Default for TransportTimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_ms(),
            heartbeat_timeout_ms: default_heartbeat_ms(),
            fault_window_secs: default_fault_window_secs(),
            fault_limit: default_fault_limit(),
        }
    }
}

impl Default for SessionTimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter: default_reconnect_jitter(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frozen_check_interval_ms() -> u64 {
    30_000
}

fn default_price_overlaps_check_interval_ms() -> u64 {
    5_000
}

fn default_staleness_depth() -> usize {
    10
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_fault_window_secs() -> u64 {
    120
}

fn default_fault_limit() -> u32 {
    4
}

fn default_handshake_timeout_ms() -> u64 {
    60_000
}

fn default_keepalive_secs() -> u64 {
    20
}

fn default_reconnect_initial_delay_ms() -> u64 {
    250
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter() -> bool {
    true
}

fn default_venue_driver_name() -> String {
    "bybit".to_string()
}

fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broadcast_interval_ms() -> u64 {
    1_000
}

fn default_bridge_depth() -> usize {
    100
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `TIDEMARK_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("TIDEMARK")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_behavior() {
        let replica = ReplicaChecksConfig::default();
        assert_eq!(replica.frozen_check_interval(), Duration::from_secs(30));
        assert_eq!(
            replica.price_overlaps_check_interval(),
            Duration::from_secs(5)
        );
        assert_eq!(replica.staleness_depth, 10);

        let transport = TransportTimingConfig::default();
        assert_eq!(transport.heartbeat_interval(), Duration::from_millis(1000));
        assert_eq!(transport.heartbeat_timeout(), Duration::from_millis(1000));
        assert_eq!(transport.fault_window(), Duration::from_secs(120));
        assert_eq!(transport.fault_limit, 4);

        let session = SessionTimingConfig::default();
        assert_eq!(session.handshake_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn venue_block_keeps_freeform_params() {
        let raw = r#"{
            "ws_url": "wss://stream.example.com/ws",
            "rest_url": "https://api.example.com",
            "driver": "binance",
            "depth": 50,
            "channel": "linear"
        }"#;
        let venue: VenueConfig = serde_json::from_str(raw).expect("venue config parses");
        assert_eq!(venue.driver, "binance");
        assert_eq!(venue.params["depth"], 50);
        assert_eq!(venue.params["channel"], "linear");
        assert!(venue.api_key.is_empty());
    }
}
