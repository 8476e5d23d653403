//! Explicit wiring of the client's components.

use std::sync::Arc;

use tracing::info;

use courier_net::{spawn_network, Connector, Network, WebSocketConnector};
use courier_shared::Identity;
use courier_store::{MessageCache, SqliteCache};

use crate::config::ClientConfig;
use crate::engine::DirectMessageEngine;
use crate::error::ConfigError;

/// Everything a running client needs, built once at startup and passed to
/// whoever needs it.
pub struct ClientContext {
    pub config: ClientConfig,
    pub network: Network,
    pub engine: Arc<DirectMessageEngine>,
}

impl ClientContext {
    /// Wire the engine over an arbitrary transport and cache. Must run
    /// inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn MessageCache>,
    ) -> Self {
        let network = spawn_network(config.net_config(), connector);
        let engine = Arc::new(DirectMessageEngine::new(
            network.router.clone(),
            cache,
            config.fetch_timeout,
        ));
        Self {
            config,
            network,
            engine,
        }
    }

    /// Websocket transport and the on-disk cache.
    pub fn open(config: ClientConfig) -> Result<Self, ConfigError> {
        let cache = match &config.db_path {
            Some(path) => SqliteCache::open_at(path)?,
            None => SqliteCache::open_default()?,
        };
        let connector = WebSocketConnector::new(config.connect_timeout);
        Ok(Self::new(config, Arc::new(connector), Arc::new(cache)))
    }

    /// The identity named by `secret_key` in the configuration, if any.
    pub fn configured_identity(&self) -> Result<Option<Identity>, ConfigError> {
        self.config
            .secret_key
            .as_deref()
            .map(|hex| Identity::from_secret_hex(hex).map_err(|e| ConfigError::SecretKey(e.to_string())))
            .transpose()
    }

    /// Connect to the configured relays.
    pub async fn start(&self) {
        self.network.manager.bootstrap().await;
        info!(relays = self.network.manager.list_relays().await.len(), "Client started");
    }

    /// Log out and drop every relay connection.
    pub async fn shutdown(&self) {
        self.engine.logout().await;
        self.network.manager.set_auto_reconnect(false);
        for relay in self.network.manager.list_relays().await {
            let _ = self.network.manager.remove_relay(&relay.url).await;
        }
        info!("Client stopped");
    }
}
