use std::time::Duration;

/// DNS-SD service type advertised by the producer (without the domain)
pub const SERVICE_TYPE: &str = "_batterybridge._tcp";

/// Human-readable service name
pub const SERVICE_NAME: &str = "BatteryBridge";

/// Discovery scope
pub const SERVICE_DOMAIN: &str = "local.";

/// Well-known TCP port the producer listens on
pub const SERVICE_PORT: u16 = 54321;

/// TXT record key carrying the human-readable name
pub const TXT_NAME: &str = "name";

/// Largest chunk a receiver reads per receive call. Payloads are short
/// decimal strings and never approach this.
pub const MAX_PAYLOAD_LEN: usize = 100;

/// Delay before restarting a failed listener or scanner, and before
/// reconnecting to an endpoint that reported a waiting condition.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Cadence of the producer's periodic broadcast
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
