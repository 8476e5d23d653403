use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Event id does not match its contents")]
    IdMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signing failed: {0}")]
    Signing(#[from] IdentityError),

    #[error(transparent)]
    Encryption(#[from] CryptoError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Filter matches everything; at least one constraint is required")]
    Unconstrained,

    #[error("Invalid {field} value: {value}")]
    InvalidHex { field: &'static str, value: String },

    #[error("Invalid tag name: {0:?}")]
    InvalidTagName(char),

    #[error("Tag filter #{0} has no accepted values")]
    EmptyTagValues(char),

    #[error("`since` ({since}) is after `until` ({until})")]
    InvertedRange { since: u64, until: u64 },

    #[error("Limit must be greater than zero")]
    ZeroLimit,
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayUrlError {
    #[error("Relay URL must start with ws:// or wss://: {0}")]
    UnsupportedScheme(String),

    #[error("Relay URL is malformed: {0}")]
    Malformed(String),
}
