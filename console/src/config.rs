use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ConsoleIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Command API base, including the `/api` prefix.
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub log_capacity: usize,
    pub feed: FeedConfig,
    pub batch: BatchConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            request_timeout_ms: 10_000,
            log_capacity: 100,
            feed: FeedConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl ConsoleConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("Failed to read config {:?}", path))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {:?}", parent))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;
        fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Floor for the pause between feed connection attempts.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// MQTT client id prefix; a random suffix keeps concurrent consoles apart.
    pub client_id: String,
    /// Prefix shared by every subscribed topic, without trailing slash.
    pub topic_prefix: String,
    /// Address the registration message is published to.
    pub register_address: String,
    pub reconnect_delay_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    /// Zero disables the dead-connection watchdog.
    pub heartbeat_incoming_ms: u64,
    pub connect_timeout_ms: u64,
    pub subscribe_node_metrics: bool,
    pub identity: ConsoleIdentity,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "migration-console".to_string(),
            topic_prefix: "topic".to_string(),
            register_address: "app/node/register".to_string(),
            reconnect_delay_ms: 5_000,
            heartbeat_outgoing_ms: 4_000,
            heartbeat_incoming_ms: 4_000,
            connect_timeout_ms: 10_000,
            subscribe_node_metrics: true,
            identity: ConsoleIdentity::default(),
        }
    }
}

impl FeedConfig {
    /// Never below [`MIN_RECONNECT_DELAY`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms).max(MIN_RECONNECT_DELAY)
    }

    pub fn heartbeat_outgoing(&self) -> Duration {
        Duration::from_millis(self.heartbeat_outgoing_ms)
    }

    /// Silence tolerated before the connection is declared dead.
    pub fn dead_connection_after(&self) -> Option<Duration> {
        if self.heartbeat_incoming_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.heartbeat_incoming_ms.saturating_mul(2)))
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub pacing_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { pacing_ms: 500 }
    }
}

impl BatchConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("migration-console");
    dir.push("config.json");
    dir
}
