use thiserror::Error;

use courier_shared::{FilterError, RelayUrlError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake timed out after {0}s")]
    Timeout(u64),

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Could not encode frame: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    InvalidUrl(#[from] RelayUrlError),

    #[error("Unknown relay: {0}")]
    UnknownRelay(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("A subscription needs at least one filter")]
    NoFilters,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Relay rejected event: {0}")]
    Rejected(String),

    #[error("No acknowledgement within {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
