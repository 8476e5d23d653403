use std::time::Duration;

use courier_shared::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_RELAYS, PUBLISH_TIMEOUT_MS, RECONNECT_INTERVAL_SECS,
    SUBSCRIPTION_DEDUP_CAPACITY,
};

/// Tunables for the relay manager and subscription router.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Relays added on bootstrap and by `restore_defaults`.
    pub default_relays: Vec<String>,
    /// Start the reconnect supervisor on construction.
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    /// How long a publish waits for a relay's `OK`.
    pub publish_timeout: Duration,
    /// Drop inbound events whose id or signature does not check out.
    pub verify_events: bool,
    /// Event ids each subscription remembers; the oldest are forgotten first.
    pub dedup_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(RECONNECT_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            publish_timeout: Duration::from_millis(PUBLISH_TIMEOUT_MS),
            verify_events: true,
            dedup_capacity: SUBSCRIPTION_DEDUP_CAPACITY,
        }
    }
}
