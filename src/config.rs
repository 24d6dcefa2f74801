use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BROKER_HOST: &str = "localhost";
const DEFAULT_BROKER_PORT: u16 = 8884;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 4000;
const DEFAULT_RECONNECT_MS: u64 = 2000;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Top-level configuration for a [`ClockClient`](crate::ClockClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub broker: BrokerConfig,
    pub topics: Topics,
    /// Directory holding `devices.json`
    pub data_dir: PathBuf,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: Topics::default(),
            data_dir: PathBuf::from("./.smartclock"),
        }
    }
}

impl ClockConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Defaults overridden by `CLOCK_MQTT_HOST`, `CLOCK_MQTT_PORT` and `CLOCK_DATA_DIR`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply environment overrides on top of this configuration
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("CLOCK_MQTT_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = std::env::var("CLOCK_MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.broker.port = port,
                Err(_) => tracing::warn!("Ignoring invalid CLOCK_MQTT_PORT: {}", port),
            }
        }
        if let Ok(dir) = std::env::var("CLOCK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Location of the saved device list
    pub fn devices_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }
}

/// How to reach the MQTT broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: BrokerTransport,
    /// URL path for WebSocket transports
    pub path: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            transport: BrokerTransport::Wss,
            path: "/mqtt".to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keep-alive interval, never below 5 seconds
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    /// Broker address in the form the transport expects
    pub fn url(&self) -> String {
        match self.transport {
            BrokerTransport::Tcp => self.host.clone(),
            BrokerTransport::Ws => format!("ws://{}:{}{}", self.host, self.port, self.path),
            BrokerTransport::Wss => format!("wss://{}:{}{}", self.host, self.port, self.path),
        }
    }
}

/// Wire transport to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTransport {
    Tcp,
    Ws,
    Wss,
}

/// Delay between automatic reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Same delay every time, retrying forever
    Fixed { delay_ms: u64 },
    /// Doubling delay starting at `initial_ms`, capped at `max_ms`
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay_ms: DEFAULT_RECONNECT_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            ReconnectPolicy::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Broker topics used by the clock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub command: String,
    pub status: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "clock/cmd".to_string(),
            status: "clock/status".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_browser_client() {
        let config = ClockConfig::default();
        assert_eq!(config.broker.connect_timeout(), Duration::from_millis(4000));
        assert_eq!(config.broker.reconnect.delay(0), Duration::from_millis(2000));
        assert_eq!(config.broker.reconnect.delay(50), Duration::from_millis(2000));
        assert_eq!(config.broker.url(), "wss://localhost:8884/mqtt");
        assert_eq!(config.topics.command, "clock/cmd");
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::Exponential {
            initial_ms: 500,
            max_ms: 8000,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(5), Duration::from_millis(8000));
        assert_eq!(policy.delay(200), Duration::from_millis(8000));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.json");
        std::fs::write(
            &path,
            r#"{
                "broker": {
                    "host": "broker.example.org",
                    "transport": "ws",
                    "reconnect": { "kind": "exponential", "initial_ms": 1000, "max_ms": 60000 }
                },
                "topics": { "command": "esp32/clock/cmd" }
            }"#,
        )
        .unwrap();

        let config = ClockConfig::load(&path).unwrap();
        assert_eq!(config.broker.host, "broker.example.org");
        assert_eq!(config.broker.port, 8884);
        assert_eq!(config.broker.url(), "ws://broker.example.org:8884/mqtt");
        assert_eq!(config.topics.command, "esp32/clock/cmd");
        assert_eq!(config.topics.status, "clock/status");
        assert_eq!(config.broker.reconnect.delay(1), Duration::from_millis(2000));
    }

    #[test]
    fn tcp_url_is_bare_host() {
        let broker = BrokerConfig {
            transport: BrokerTransport::Tcp,
            host: "10.0.0.2".to_string(),
            ..BrokerConfig::default()
        };
        assert_eq!(broker.url(), "10.0.0.2");
    }
}
