use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::RETRY_BACKOFF;
use shared::retry::RetryPolicy;
use shared::types::ServiceIdentity;
use crate::discoverer::DiscovererSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceIdentity,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MdnsConfig {
    /// Restrict the responder to one interface, e.g. "wlan0"
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_secs: u64,
}

fn default_backoff() -> u64 {
    RETRY_BACKOFF.as_secs()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retry_backoff_secs: default_backoff(),
            reconnect_backoff_secs: default_backoff(),
        }
    }
}

impl DiscoveryConfig {
    pub fn settings(&self) -> DiscovererSettings {
        DiscovererSettings {
            rescan: RetryPolicy::fixed(Duration::from_secs(self.retry_backoff_secs)),
            reconnect: RetryPolicy::fixed(Duration::from_secs(self.reconnect_backoff_secs)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
