use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

/// Server URL used when none is configured.
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Keep-alive ping interval used when none is configured.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Unanswered pings tolerated when none is configured.
pub const DEFAULT_MAX_PINGS_OUT: u32 = 3;

/// Pause between failed connection attempts when none is configured.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Replay cache capacity used when none (or zero) is configured.
pub const DEFAULT_REPLAY_CAPACITY: usize = 10_000;

/// Configuration for [`crate::StreamingClient`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamingConfig {
    /// Identifier of the bus cluster.
    pub cluster_id: String,

    /// Identifier of this client within the cluster.
    pub client_id: String,

    /// Server URLs. Empty means [`DEFAULT_URL`].
    #[serde(default)]
    pub urls: Vec<String>,

    /// Keep-alive ping interval.
    #[serde(default)]
    pub ping_interval: Option<Duration>,

    /// Unanswered pings after which the connection is considered lost.
    #[serde(default)]
    pub max_pings_out: Option<u32>,

    /// Pause between failed connection attempts.
    #[serde(default)]
    pub reconnect_interval: Option<Duration>,

    /// Maximum number of publishes held for replay. Zero means the default.
    #[serde(default)]
    pub replay_capacity: Option<usize>,
}

/// A [`StreamingConfig`] with every default filled in.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) cluster_id: String,
    pub(crate) client_id: String,
    pub(crate) urls: Vec<String>,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u32,
    pub(crate) reconnect_interval: Duration,
    pub(crate) replay_capacity: NonZeroUsize,
}

impl From<StreamingConfig> for Settings {
    fn from(config: StreamingConfig) -> Self {
        let urls = if config.urls.is_empty() {
            vec![DEFAULT_URL.to_string()]
        } else {
            config.urls
        };

        let replay_capacity = config
            .replay_capacity
            .and_then(NonZeroUsize::new)
            .or_else(|| NonZeroUsize::new(DEFAULT_REPLAY_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            cluster_id: config.cluster_id,
            client_id: config.client_id,
            urls,
            ping_interval: config.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            max_pings_out: config.max_pings_out.unwrap_or(DEFAULT_MAX_PINGS_OUT),
            reconnect_interval: config
                .reconnect_interval
                .unwrap_or(DEFAULT_RECONNECT_INTERVAL),
            replay_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_filled_in() {
        let settings = Settings::from(StreamingConfig {
            cluster_id: "cluster".to_string(),
            client_id: "client".to_string(),
            ..StreamingConfig::default()
        });

        assert_eq!(settings.urls, vec![DEFAULT_URL.to_string()]);
        assert_eq!(settings.ping_interval, DEFAULT_PING_INTERVAL);
        assert_eq!(settings.max_pings_out, DEFAULT_MAX_PINGS_OUT);
        assert_eq!(settings.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(settings.replay_capacity.get(), DEFAULT_REPLAY_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_means_default() {
        let settings = Settings::from(StreamingConfig {
            replay_capacity: Some(0),
            ..StreamingConfig::default()
        });

        assert_eq!(settings.replay_capacity.get(), DEFAULT_REPLAY_CAPACITY);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: StreamingConfig = serde_json::from_str(
            r#"{
                "cluster_id": "prod",
                "client_id": "orders-service",
                "urls": ["nats://a:4222", "nats://b:4222"],
                "reconnect_interval": { "secs": 1, "nanos": 0 },
                "replay_capacity": 64
            }"#,
        )
        .unwrap();
        let settings = Settings::from(config);

        assert_eq!(settings.cluster_id, "prod");
        assert_eq!(settings.urls.len(), 2);
        assert_eq!(settings.reconnect_interval, Duration::from_secs(1));
        assert_eq!(settings.ping_interval, DEFAULT_PING_INTERVAL);
        assert_eq!(settings.replay_capacity.get(), 64);
    }
}
