use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{BROADCAST_INTERVAL, RETRY_BACKOFF};
use shared::retry::RetryPolicy;
use shared::types::{ServiceIdentity, TelemetryValue};
use crate::advertiser::AdvertiserSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceIdentity,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub advertiser: AdvertiserConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MdnsConfig {
    /// Restrict the responder to one interface, e.g. "wlan0"
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvertiserConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    #[serde(default = "default_capacity_path")]
    pub capacity_path: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Serve this value instead of reading a battery
    pub fixed_level: Option<TelemetryValue>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_broadcast_interval() -> u64 {
    BROADCAST_INTERVAL.as_secs()
}

fn default_retry_backoff() -> u64 {
    RETRY_BACKOFF.as_secs()
}

fn default_capacity_path() -> PathBuf {
    PathBuf::from("/sys/class/power_supply/BAT0/capacity")
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            broadcast_interval_secs: default_broadcast_interval(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_path: default_capacity_path(),
            poll_interval_secs: default_poll_interval(),
            fixed_level: None,
        }
    }
}

impl AdvertiserConfig {
    pub fn settings(&self) -> AdvertiserSettings {
        AdvertiserSettings {
            bind: self.bind,
            broadcast_interval: Duration::from_secs(self.broadcast_interval_secs.max(1)),
            retry: RetryPolicy::fixed(Duration::from_secs(self.retry_backoff_secs)),
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
