//! Engine configuration, loaded from environment variables with defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Which bus transport to construct; see [`crate::bus::transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    InProcess,
    Polling,
    Datagram,
    Notify,
}

impl Default for BusType {
    fn default() -> Self {
        BusType::InProcess
    }
}

/// Top-level engine configuration.
///
/// Loaded via the `config` crate layering environment variables prefixed
/// `RETROTRO_` over these defaults, the way `kimberlite-config` composes a
/// `KimberliteConfig` from sub-sections. Every field has a default, so a
/// bare `Config::load()` with no environment is always valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus_type: BusType,
    pub bus_endpoint: Option<String>,
    pub bus_credentials: Option<String>,
    pub disconnect_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub pong_deadline_ms: u64,
    pub write_deadline_ms: u64,
    pub outbound_queue_capacity: usize,
    pub tick_sparse_interval_s: u64,
    pub tick_dense_threshold_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_type: BusType::default(),
            bus_endpoint: None,
            bus_credentials: None,
            disconnect_grace_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            pong_deadline_ms: 60_000,
            write_deadline_ms: 10_000,
            outbound_queue_capacity: 256,
            tick_sparse_interval_s: 5,
            tick_dense_threshold_s: 10,
        }
    }
}

impl Config {
    /// Loads configuration from `RETROTRO_`-prefixed environment variables,
    /// layered over [`Config::default`].
    pub fn load() -> Result<Self, EngineError> {
        let defaults = Self::default();
        let source = config::Config::builder()
            .add_source(config::Config::try_from(&defaults).map_err(config_error)?)
            .add_source(
                config::Environment::with_prefix("RETROTRO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;
        source.try_deserialize().map_err(config_error)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_deadline(&self) -> Duration {
        Duration::from_millis(self.pong_deadline_ms)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

fn config_error(err: config::ConfigError) -> EngineError {
    EngineError::TransientRepository(format!("configuration: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.bus_type, BusType::InProcess);
        assert_eq!(config.disconnect_grace_ms, 10_000);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.tick_sparse_interval_s, 5);
        assert_eq!(config.tick_dense_threshold_s, 10);
    }

    #[test]
    fn load_with_empty_environment_yields_defaults() {
        let config = Config::load().expect("defaults alone must be a valid config");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn bus_type_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&BusType::Datagram).unwrap(),
            "\"datagram\""
        );
    }
}
