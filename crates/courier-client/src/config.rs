//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client runs with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use courier_net::NetConfig;
use courier_shared::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_RELAYS, FETCH_TIMEOUT_MS, PUBLISH_TIMEOUT_MS,
    RECONNECT_INTERVAL_SECS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Relays used on first start and by `restore_defaults`.
    /// Env: `COURIER_RELAYS` (comma-separated)
    pub relays: Vec<String>,

    /// Env: `COURIER_AUTO_RECONNECT` (true/false)
    /// Default: `true`
    pub auto_reconnect: bool,

    /// Env: `COURIER_RECONNECT_INTERVAL_SECS`
    pub reconnect_interval: Duration,

    /// Env: `COURIER_CONNECT_TIMEOUT_SECS`
    pub connect_timeout: Duration,

    /// How long a publish waits for each relay's acknowledgement.
    /// Env: `COURIER_PUBLISH_TIMEOUT_MS`
    pub publish_timeout: Duration,

    /// Upper bound on collecting stored events during a fetch.
    /// Env: `COURIER_FETCH_TIMEOUT_MS`
    pub fetch_timeout: Duration,

    /// Cache location. `None` selects the platform data directory.
    /// Env: `COURIER_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Hex secret key of the local identity.
    /// Env: `COURIER_SECRET_KEY`
    pub secret_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(RECONNECT_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            publish_timeout: Duration::from_millis(PUBLISH_TIMEOUT_MS),
            fetch_timeout: Duration::from_millis(FETCH_TIMEOUT_MS),
            db_path: None,
            secret_key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`; unparseable values are logged
    /// and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(relays) = lookup("COURIER_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if relays.is_empty() {
                tracing::warn!("COURIER_RELAYS is empty, using built-in relays");
            } else {
                config.relays = relays;
            }
        }

        if let Some(val) = lookup("COURIER_AUTO_RECONNECT") {
            config.auto_reconnect = val != "false" && val != "0";
        }

        if let Some(secs) = parse_number("COURIER_RECONNECT_INTERVAL_SECS", &lookup) {
            config.reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_number("COURIER_CONNECT_TIMEOUT_SECS", &lookup) {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_number("COURIER_PUBLISH_TIMEOUT_MS", &lookup) {
            config.publish_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number("COURIER_FETCH_TIMEOUT_MS", &lookup) {
            config.fetch_timeout = Duration::from_millis(ms);
        }

        if let Some(path) = lookup("COURIER_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(secret) = lookup("COURIER_SECRET_KEY") {
            let secret = secret.trim();
            if !secret.is_empty() {
                config.secret_key = Some(secret.to_string());
            }
        }

        config
    }

    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            default_relays: self.relays.clone(),
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: self.reconnect_interval,
            connect_timeout: self.connect_timeout,
            publish_timeout: self.publish_timeout,
            ..NetConfig::default()
        }
    }
}

/// Positive integer from `key`, or `None` (with a warning) if it is invalid.
fn parse_number(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}
