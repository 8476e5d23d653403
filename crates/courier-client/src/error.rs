use thiserror::Error;

use courier_net::SubscriptionError;
use courier_shared::EventError;
use courier_store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("No identity is logged in")]
    NoIdentity,

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Could not build message: {0}")]
    Event(#[from] EventError),

    #[error("No writable relay is connected")]
    NoRelay,

    #[error("No relay accepted the message ({attempted} tried)")]
    NotAccepted { attempted: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("No identity is logged in")]
    NoIdentity,

    #[error("No readable relay is connected")]
    NoRelay,

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No identity is logged in")]
    NoIdentity,

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid secret key: {0}")]
    SecretKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
