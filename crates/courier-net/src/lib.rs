pub mod config;
pub mod error;
pub mod manager;
pub mod network;
pub mod router;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use config::NetConfig;
pub use error::{ConnectionError, PublishError, RelayError, SubscriptionError};
pub use manager::{RelayConnectionManager, RelayEndpoint};
pub use network::{spawn_network, Network};
pub use router::{PublishResult, Subscription, SubscriptionCloser, SubscriptionEvent, SubscriptionRouter};
pub use session::RelayStatus;
pub use transport::{Connector, WebSocketConnector};
