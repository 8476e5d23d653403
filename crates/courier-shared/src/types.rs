use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::CHAT_ID_SEPARATOR;
use crate::error::{IdentityError, RelayUrlError};

// User identity = x-only secp256k1 public key (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| IdentityError::InvalidPublicKey(format!("{s}: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey(format!("{s}: expected 32 bytes")))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Order-independent identifier of a two-party conversation.
///
/// Both participants' keys are hex-encoded, sorted and joined with
/// [`CHAT_ID_SEPARATOR`], so `ChatId::new(a, b) == ChatId::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(a: &PublicKey, b: &PublicKey) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}{}{}",
            first.to_hex(),
            CHAT_ID_SEPARATOR,
            second.to_hex()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participants, lowest key first.
    pub fn participants(&self) -> Option<(PublicKey, PublicKey)> {
        let (a, b) = self.0.split_once(CHAT_ID_SEPARATOR)?;
        Some((PublicKey::from_hex(a).ok()?, PublicKey::from_hex(b).ok()?))
    }

    /// The participant that is not `me`, if `me` takes part in this chat.
    pub fn counterpart(&self, me: &PublicKey) -> Option<PublicKey> {
        let (a, b) = self.participants()?;
        if &a == me {
            Some(b)
        } else if &b == me {
            Some(a)
        } else {
            None
        }
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalise a relay URL.
///
/// Accepts only `ws://` and `wss://` URLs with a host. The scheme is
/// lowercased and trailing slashes are stripped, so `WSS://relay.example.com/`
/// and `wss://relay.example.com` name the same endpoint.
pub fn normalize_relay_url(raw: &str) -> Result<String, RelayUrlError> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();

    let scheme_len = if lower.starts_with("wss://") {
        6
    } else if lower.starts_with("ws://") {
        5
    } else {
        return Err(RelayUrlError::UnsupportedScheme(trimmed.to_string()));
    };

    let rest = trimmed[scheme_len..].trim_end_matches('/');
    if rest.is_empty() {
        return Err(RelayUrlError::Malformed(trimmed.to_string()));
    }

    let normalized = format!("{}{}", &lower[..scheme_len], rest);
    let parsed = url::Url::parse(&normalized)
        .map_err(|e| RelayUrlError::Malformed(format!("{trimmed}: {e}")))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(RelayUrlError::Malformed(trimmed.to_string()));
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey([byte; 32])
    }

    #[test]
    fn test_pubkey_hex_roundtrip() {
        let pk = key(0xab);
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
        assert_eq!(pk.short(), "abababab");
    }

    #[test]
    fn test_pubkey_rejects_wrong_length() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_pubkey_serde_as_hex() {
        let pk = key(0x01);
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }

    #[test]
    fn test_chat_id_sorted() {
        let id = ChatId::new(&key(0x02), &key(0x01));
        assert!(id.as_str().starts_with(&"01".repeat(32)));
        assert_eq!(id.participants(), Some((key(0x01), key(0x02))));
    }

    #[test]
    fn test_chat_id_counterpart() {
        let id = ChatId::new(&key(0x01), &key(0x02));
        assert_eq!(id.counterpart(&key(0x01)), Some(key(0x02)));
        assert_eq!(id.counterpart(&key(0x02)), Some(key(0x01)));
        assert_eq!(id.counterpart(&key(0x03)), None);
    }

    #[test]
    fn test_chat_id_with_self() {
        let id = ChatId::new(&key(0x07), &key(0x07));
        assert_eq!(id.counterpart(&key(0x07)), Some(key(0x07)));
    }

    #[test]
    fn test_normalize_strips_trailing_slash() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/").unwrap(),
            "wss://relay.example.com"
        );
        assert_eq!(
            normalize_relay_url("  WSS://relay.example.com//  ").unwrap(),
            "wss://relay.example.com"
        );
        assert_eq!(
            normalize_relay_url("ws://localhost:7777").unwrap(),
            "ws://localhost:7777"
        );
    }

    #[test]
    fn test_normalize_keeps_path() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/nostr/").unwrap(),
            "wss://relay.example.com/nostr"
        );
    }

    #[test]
    fn test_normalize_rejects_bad_urls() {
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            Err(RelayUrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            normalize_relay_url("relay.example.com"),
            Err(RelayUrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            normalize_relay_url("wss://"),
            Err(RelayUrlError::Malformed(_))
        ));
        assert!(normalize_relay_url("wss://bad host").is_err());
    }

    proptest! {
        #[test]
        fn chat_id_is_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let a = PublicKey(a);
            let b = PublicKey(b);
            prop_assert_eq!(ChatId::new(&a, &b), ChatId::new(&b, &a));
        }
    }
}
