//! # courier-client
//!
//! Encrypted direct messaging over a set of relays, with a local-first
//! cache. [`ClientContext`] wires the relay network, the cache and the
//! [`DirectMessageEngine`] together.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod index;
pub mod logging;

pub use config::ClientConfig;
pub use context::ClientContext;
pub use engine::{DirectMessageEngine, LiveSubscription};
pub use error::{ConfigError, EngineError, FetchError, SendError};
pub use index::ConversationIndex;
