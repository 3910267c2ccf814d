#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_URL: &str = "ws://localhost:3001";
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_DELAY_DURATION: Duration = Duration::from_millis(1_000);
const DEFAULT_RECONNECT_MAX_DELAY_DURATION: Duration = Duration::from_millis(30_000);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_millis(20_000);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_millis(30_000);
const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Configuration for the connection manager.
///
/// Deserializes from the camelCase option names used by JavaScript clients of the same
/// server, with durations given in milliseconds:
///
/// ```json
/// { "url": "wss://push.example.com", "maxReconnectAttempts": 5, "reconnectBaseDelayMs": 1000 }
/// ```
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Server endpoint (`ws://` or `wss://`)
    #[builder(into, default = DEFAULT_URL.to_owned())]
    pub url: String,
    /// Reconnection attempts before giving up with `reconnect_failed`
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt, doubled for each later one
    #[serde(rename = "reconnectBaseDelayMs")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_RECONNECT_BASE_DELAY_DURATION)]
    pub reconnect_base_delay: Duration,
    /// Upper bound for any reconnection delay, jitter included
    #[serde(rename = "reconnectMaxDelayMs")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_RECONNECT_MAX_DELAY_DURATION)]
    pub reconnect_max_delay: Duration,
    /// Time allowed for a handshake to complete
    #[serde(rename = "connectTimeoutMs")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_CONNECT_TIMEOUT_DURATION)]
    pub connect_timeout: Duration,
    /// Interval between heartbeat probes while connected
    #[serde(rename = "heartbeatIntervalMs")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Maximum number of messages buffered while disconnected
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY_DURATION,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Parse a configuration from JSON, then validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the connection manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "url scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::validation(
                "queue capacity must be greater than zero",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::validation("connect timeout must be non-zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::validation("heartbeat interval must be non-zero"));
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(Error::validation(format!(
                "reconnect base delay {:?} exceeds max delay {:?}",
                self.reconnect_base_delay, self.reconnect_max_delay
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 100);
        config.validate().unwrap();
    }

    #[test]
    fn builder_matches_defaults() {
        let config = Config::builder().url("wss://push.example.com").build();

        assert_eq!(config.url, "wss://push.example.com");
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 100);
    }

    #[test]
    fn from_json_uses_millisecond_options() {
        let config = Config::from_json(
            r#"{
                "url": "wss://push.example.com/socket",
                "maxReconnectAttempts": 2,
                "reconnectBaseDelayMs": 100,
                "heartbeatIntervalMs": 5000
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let config = Config::builder().queue_capacity(0).build();

        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn validate_rejects_http_scheme() {
        let config = Config::builder().url("https://push.example.com").build();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheme"), "unexpected: {err}");
    }

    #[test]
    fn validate_rejects_inverted_delays() {
        let config = Config::builder()
            .reconnect_base_delay(Duration::from_secs(60))
            .build();

        config.validate().unwrap_err();
    }
}
