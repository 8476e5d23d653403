/// Application name
pub const APP_NAME: &str = "Courier";

/// Event kind carrying an encrypted direct message
pub const KIND_DIRECT_MESSAGE: u16 = 4;

/// Tag naming the addressed party of an event
pub const TAG_PUBKEY: &str = "p";

/// Separator between the two sorted public keys of a chat id
pub const CHAT_ID_SEPARATOR: char = ':';

/// Shown in place of the plaintext when a message cannot be decrypted
pub const DECRYPTION_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Well-known relays used when bootstrapping or restoring defaults
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.primal.net",
];

/// Reconnect supervisor interval in seconds
pub const RECONNECT_INTERVAL_SECS: u64 = 30;

/// Relay handshake timeout in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// How long to wait for a relay `OK` after publishing, in milliseconds
pub const PUBLISH_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on waiting for end-of-stored-events during a fetch, in milliseconds
pub const FETCH_TIMEOUT_MS: u64 = 2_000;

/// Event ids remembered per subscription for deduplication
pub const SUBSCRIPTION_DEDUP_CAPACITY: usize = 10_000;

/// Hex-encoded length of public keys, event ids (32 bytes)
pub const HEX32_LEN: usize = 64;

/// Hex-encoded length of a Schnorr signature (64 bytes)
pub const SIGNATURE_HEX_LEN: usize = 128;

/// HKDF salt for NIP-44 v2 conversation keys
pub const NIP44_SALT: &[u8] = b"nip44-v2";

/// NIP-44 payload version byte
pub const NIP44_VERSION: u8 = 2;

/// NIP-44 per-message nonce size in bytes
pub const NIP44_NONCE_SIZE: usize = 32;

/// HMAC-SHA256 tag size in bytes
pub const NIP44_MAC_SIZE: usize = 32;

/// Plaintext bounds accepted by the codec, in bytes
pub const MIN_PLAINTEXT_SIZE: usize = 1;
pub const MAX_PLAINTEXT_SIZE: usize = 65_535;
