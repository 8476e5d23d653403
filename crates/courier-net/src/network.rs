use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::NetConfig;
use crate::manager::RelayConnectionManager;
use crate::router::SubscriptionRouter;
use crate::transport::Connector;

/// The relay manager and the router wired to the same session events.
#[derive(Clone)]
pub struct Network {
    pub manager: Arc<RelayConnectionManager>,
    pub router: Arc<SubscriptionRouter>,
}

/// Build the network layer. Must run inside a tokio runtime.
///
/// No relays are added; call `manager.bootstrap()` or `add_relay`.
pub fn spawn_network(config: NetConfig, connector: Arc<dyn Connector>) -> Network {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = RelayConnectionManager::new(config, connector, events_tx);
    let router = Arc::new(SubscriptionRouter::new(manager.clone(), events_rx));
    Network { manager, router }
}
