//! Pipeline Configuration Settings
//!
//! Configuration types for the market pipeline, loaded from environment
//! variables.

use std::time::Duration;

use crate::application::services::{PipelineSettings, RuntimeConfig};
use crate::domain::normalizer::DEFAULT_MAX_GAP_FILL;
use crate::infrastructure::feed::{FeedConnectorConfig, HeartbeatConfig, ReconnectConfig};

/// Feed WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Upper bound on the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Heartbeat probe interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Uptime after which the backoff resets.
    pub reconnect_stable_period: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_stable_period: Duration::from_secs(60),
        }
    }
}

/// Queue, cache and worker sizing.
#[derive(Debug, Clone)]
pub struct PipelineTuning {
    /// Raw tick queue capacity.
    pub tick_queue_capacity: usize,
    /// Outbound queue capacity per subscriber.
    pub subscriber_buffer: usize,
    /// Closed bars kept per series.
    pub snapshot_capacity: usize,
    /// Delay between the last detach and teardown.
    pub grace_period: Duration,
    /// Teardown sweep interval.
    pub sweep_interval: Duration,
    /// Number of shard workers.
    pub worker_shards: usize,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            tick_queue_capacity: 10_000,
            subscriber_buffer: 256,
            snapshot_capacity: 500,
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            worker_shards: 4,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Consumer WebSocket push port.
    pub push_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            push_port: 8090,
            health_port: 8091,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upstream feed WebSocket URL.
    pub feed_url: String,
    /// Server port settings.
    pub server: ServerSettings,
    /// Feed connection settings.
    pub websocket: WebSocketSettings,
    /// Pipeline sizing.
    pub pipeline: PipelineTuning,
}

impl PipelineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_FEED_URL` is missing or empty, or a
    /// capacity is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`PipelineConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let feed_url = lookup("MARKET_FEED_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_FEED_URL".to_string()))?;
        if feed_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_FEED_URL".to_string()));
        }

        let env = EnvReader { lookup: &lookup };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            push_port: env.parse("MARKET_PIPELINE_PUSH_PORT", server_defaults.push_port),
            health_port: env.parse("MARKET_PIPELINE_HEALTH_PORT", server_defaults.health_port),
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            connect_timeout: env.secs("MARKET_PIPELINE_CONNECT_TIMEOUT_SECS", ws.connect_timeout),
            heartbeat_interval: env.secs(
                "MARKET_PIPELINE_HEARTBEAT_INTERVAL_SECS",
                ws.heartbeat_interval,
            ),
            heartbeat_timeout: env.secs(
                "MARKET_PIPELINE_HEARTBEAT_TIMEOUT_SECS",
                ws.heartbeat_timeout,
            ),
            reconnect_delay_initial: env.millis(
                "MARKET_PIPELINE_RECONNECT_DELAY_INITIAL_MS",
                ws.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "MARKET_PIPELINE_RECONNECT_DELAY_MAX_SECS",
                ws.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "MARKET_PIPELINE_RECONNECT_DELAY_MULTIPLIER",
                ws.reconnect_delay_multiplier,
            ),
            reconnect_stable_period: env.secs(
                "MARKET_PIPELINE_RECONNECT_STABLE_SECS",
                ws.reconnect_stable_period,
            ),
        };

        let tuning = PipelineTuning::default();
        let pipeline = PipelineTuning {
            tick_queue_capacity: env.capacity(
                "MARKET_PIPELINE_TICK_QUEUE_CAPACITY",
                tuning.tick_queue_capacity,
            )?,
            subscriber_buffer: env.capacity(
                "MARKET_PIPELINE_SUBSCRIBER_BUFFER",
                tuning.subscriber_buffer,
            )?,
            snapshot_capacity: env.capacity(
                "MARKET_PIPELINE_SNAPSHOT_CAPACITY",
                tuning.snapshot_capacity,
            )?,
            grace_period: env.secs("MARKET_PIPELINE_GRACE_PERIOD_SECS", tuning.grace_period),
            sweep_interval: env.secs("MARKET_PIPELINE_SWEEP_INTERVAL_SECS", tuning.sweep_interval),
            worker_shards: env.capacity("MARKET_PIPELINE_WORKER_SHARDS", tuning.worker_shards)?,
        };

        Ok(Self {
            feed_url,
            server,
            websocket,
            pipeline,
        })
    }

    /// Settings for the [`Pipeline`](crate::application::services::Pipeline).
    #[must_use]
    pub const fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            snapshot_capacity: self.pipeline.snapshot_capacity,
            subscriber_buffer: self.pipeline.subscriber_buffer,
            grace_period: self.pipeline.grace_period,
            shards: self.pipeline.worker_shards,
            max_gap_fill: DEFAULT_MAX_GAP_FILL,
        }
    }

    /// Settings for the runtime tasks.
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            sweep_interval: self.pipeline.sweep_interval.max(Duration::from_millis(100)),
            ..RuntimeConfig::default()
        }
    }

    /// Settings for the feed connector.
    #[must_use]
    pub fn feed_connector_config(&self) -> FeedConnectorConfig {
        FeedConnectorConfig {
            url: self.feed_url.clone(),
            connect_timeout: self.websocket.connect_timeout,
            reconnect: ReconnectConfig {
                initial_delay: self.websocket.reconnect_delay_initial,
                max_delay: self.websocket.reconnect_delay_max,
                multiplier: self.websocket.reconnect_delay_multiplier,
                stable_period: self.websocket.reconnect_stable_period,
                ..ReconnectConfig::default()
            },
            heartbeat: HeartbeatConfig::new(
                self.websocket.heartbeat_interval,
                self.websocket.heartbeat_timeout,
            ),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn capacity(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(key, default);
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn requires_feed_url() {
        assert!(matches!(
            PipelineConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingEnvVar(_))
        ));
        assert!(matches!(
            PipelineConfig::from_lookup(lookup(&[("MARKET_FEED_URL", "  ")])),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn defaults_apply() {
        let config =
            PipelineConfig::from_lookup(lookup(&[("MARKET_FEED_URL", "wss://feed.test/ws")]))
                .unwrap();

        assert_eq!(config.server.push_port, 8090);
        assert_eq!(config.server.health_port, 8091);
        assert_eq!(config.websocket.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.websocket.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.websocket.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.pipeline.tick_queue_capacity, 10_000);
        assert_eq!(config.pipeline.worker_shards, 4);
        assert_eq!(config.pipeline.grace_period, Duration::from_secs(30));
    }

    #[test]
    fn overrides_and_invalid_numbers() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("MARKET_FEED_URL", "wss://feed.test/ws"),
            ("MARKET_PIPELINE_PUSH_PORT", "9000"),
            ("MARKET_PIPELINE_RECONNECT_DELAY_INITIAL_MS", "250"),
            ("MARKET_PIPELINE_RECONNECT_DELAY_MULTIPLIER", "1.5"),
            ("MARKET_PIPELINE_SUBSCRIBER_BUFFER", "not-a-number"),
        ]))
        .unwrap();

        assert_eq!(config.server.push_port, 9000);
        assert_eq!(
            config.websocket.reconnect_delay_initial,
            Duration::from_millis(250)
        );
        assert!((config.websocket.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.subscriber_buffer, 256);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = PipelineConfig::from_lookup(lookup(&[
            ("MARKET_FEED_URL", "wss://feed.test/ws"),
            ("MARKET_PIPELINE_WORKER_SHARDS", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "MARKET_PIPELINE_WORKER_SHARDS"));
    }

    #[test]
    fn derived_component_configs() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("MARKET_FEED_URL", "wss://feed.test/ws"),
            ("MARKET_PIPELINE_HEARTBEAT_TIMEOUT_SECS", "3"),
            ("MARKET_PIPELINE_SNAPSHOT_CAPACITY", "50"),
        ]))
        .unwrap();

        let feed = config.feed_connector_config();
        assert_eq!(feed.url, "wss://feed.test/ws");
        assert_eq!(feed.heartbeat.pong_timeout, Duration::from_secs(3));
        assert_eq!(config.pipeline_settings().snapshot_capacity, 50);
        assert_eq!(config.runtime_config().sweep_interval, Duration::from_secs(5));
    }
}
