//! Configuration for the keywire client and relay.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::correlator::DEFAULT_ACK_TIMEOUT;
use crate::transport::{POLL_BACKOFF, POLL_INTERVAL};

/// Shortcuts denied out of the box: the chords most likely to close or
/// hijack the receiving desktop session.
pub const DEFAULT_DENYLIST: &str = "Control+W,Control+Q,Control+T,Control+N,Meta+W,Meta+Q,Alt+F4";

/// Main configuration, persisted as JSON in the platform config dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay base URL, e.g. `http://localhost:3000`.
    pub server_url: String,

    /// Whether the sanitize check of the policy gate is enabled.
    pub sanitize_enabled: bool,

    /// Whether the shortcut denylist check is enabled.
    pub denylist_enabled: bool,

    /// Comma-separated shortcut tokens to deny.
    pub denylist: String,

    /// How long to wait for an execution-ack before reporting a
    /// timeout.
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,

    /// Pull transport poll cadence.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Pull transport back-off after a failed request.
    #[serde(with = "duration_millis")]
    pub poll_backoff: Duration,

    /// Path of the persisted `clientEventId` counter.
    pub counter_path: PathBuf,

    /// Directory for local state (counter, logs).
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keywire");

        Self {
            server_url: "http://localhost:3000".to_string(),
            sanitize_enabled: true,
            denylist_enabled: true,
            denylist: DEFAULT_DENYLIST.to_string(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            poll_backoff: POLL_BACKOFF,
            counter_path: data_dir.join("client_event_id.json"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to
    /// defaults when no file exists yet.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keywire")
            .join("config.json")
    }

    /// Ensure the local state directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// The relay's WebSocket endpoint derived from the configured base
    /// URL.
    pub fn ws_url(&self) -> String {
        Self::ws_url_for(&self.server_url)
    }

    /// WebSocket endpoint for an arbitrary relay base URL.
    pub fn ws_url_for(base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/ws")
    }
}

/// Configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serde support for Duration as whole milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
