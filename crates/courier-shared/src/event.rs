use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{HEX32_LEN, SIGNATURE_HEX_LEN};
use crate::error::EventError;
use crate::identity::{verify_signature, Signer};
use crate::types::PublicKey;

/// An immutable, content-addressed, author-signed record.
///
/// `id` is the hex sha256 of `[0, pubkey, created_at, kind, tags, content]`
/// and `sig` a Schnorr signature over those 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Event fields before hashing and signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Hash the canonical serialization of an event's fields.
pub fn compute_event_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
        .map_err(|e| EventError::Serialization(e.to_string()))?;
    Ok(Sha256::digest(serialized.as_bytes()).into())
}

impl UnsignedEvent {
    /// Build an event stamped with the current time
    pub fn new(pubkey: PublicKey, kind: u16, tags: Vec<Vec<String>>, content: String) -> Self {
        Self {
            pubkey,
            created_at: unix_now(),
            kind,
            tags,
            content,
        }
    }

    pub fn id(&self) -> Result<[u8; 32], EventError> {
        compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Hash and sign. The signer must own `pubkey`.
    pub fn sign(self, signer: &dyn Signer) -> Result<SignedEvent, EventError> {
        if signer.public_key() != self.pubkey {
            return Err(EventError::Malformed(
                "event pubkey does not belong to the signer".to_string(),
            ));
        }

        let id = self.id()?;
        let sig = signer.sign(&id)?;

        Ok(SignedEvent {
            id: hex::encode(id),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        })
    }
}

impl SignedEvent {
    /// Check that `id` matches the contents and `sig` is the author's.
    pub fn verify(&self) -> Result<(), EventError> {
        if self.id.len() != HEX32_LEN || self.sig.len() != SIGNATURE_HEX_LEN {
            return Err(EventError::Malformed("bad id or signature length".to_string()));
        }

        let expected = compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(expected) != self.id {
            return Err(EventError::IdMismatch);
        }

        let sig: [u8; 64] = hex::decode(&self.sig)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(EventError::InvalidSignature)?;

        verify_signature(&self.pubkey, &expected, &sig).map_err(|_| EventError::InvalidSignature)
    }

    /// Values at position 1 of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }
}
