use std::fmt;
use std::net::SocketAddr;
use anyhow::{bail, Result};
use serde::{Serialize, Deserialize};
use crate::protocol::{SERVICE_DOMAIN, SERVICE_NAME, SERVICE_PORT, SERVICE_TYPE};

/// The published descriptor that lets a consumer find the producer.
/// Built once at startup and shared read-only by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Service type, e.g. "_batterybridge._tcp"
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,

    /// Human-readable name, cosmetic only
    #[serde(default = "default_name")]
    pub name: String,

    /// Discovery scope, e.g. "local."
    #[serde(default = "default_domain")]
    pub domain: String,

    /// TCP port the producer listens on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

fn default_name() -> String {
    SERVICE_NAME.to_string()
}

fn default_domain() -> String {
    SERVICE_DOMAIN.to_string()
}

fn default_port() -> u16 {
    SERVICE_PORT
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            name: default_name(),
            domain: default_domain(),
            port: default_port(),
        }
    }
}

impl ServiceIdentity {
    /// Fully-qualified type as the mDNS responder expects it,
    /// e.g. "_batterybridge._tcp.local."
    pub fn qualified_type(&self) -> String {
        let domain = if self.domain.ends_with('.') {
            self.domain.clone()
        } else {
            format!("{}.", self.domain)
        };
        format!("{}.{}", self.service_type.trim_end_matches('.'), domain)
    }
}

/// Battery charge percentage, always within 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TelemetryValue(u8);

impl TelemetryValue {
    pub const MAX: TelemetryValue = TelemetryValue(100);

    pub fn new(percent: u8) -> Result<Self> {
        if percent > 100 {
            bail!("telemetry value {} is outside 0..=100", percent);
        }
        Ok(Self(percent))
    }

    /// Clamp an arbitrary sensor reading into range. Negative readings are
    /// the "sensor unavailable" sentinel and map to a full charge.
    pub fn normalize(raw: i64) -> Self {
        if raw < 0 {
            Self::MAX
        } else {
            Self(raw.min(100) as u8)
        }
    }

    pub fn percent(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for TelemetryValue {
    type Error = anyhow::Error;

    fn try_from(percent: u8) -> Result<Self> {
        Self::new(percent)
    }
}

impl From<TelemetryValue> for u8 {
    fn from(value: TelemetryValue) -> u8 {
        value.0
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One announced producer endpoint from a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Full DNS-SD instance name, e.g. "BatteryBridge-phone._batterybridge._tcp.local."
    pub instance_name: String,

    /// Resolved address to connect to
    pub endpoint: SocketAddr,
}

/// Pick the endpoint to connect to from one scan round. Ties are broken by
/// instance name, then address, so the choice is reproducible.
pub fn select_endpoint(results: &[DiscoveryResult]) -> Option<&DiscoveryResult> {
    results.iter().min()
}
