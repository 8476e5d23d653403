use serde::{Deserialize, Serialize};

use crate::constants::{DECRYPTION_PLACEHOLDER, KIND_DIRECT_MESSAGE, TAG_PUBKEY};
use crate::crypto;
use crate::error::{CryptoError, EventError};
use crate::event::{SignedEvent, UnsignedEvent};
use crate::identity::Signer;
use crate::protocol::addressed_party;
use crate::types::{ChatId, PublicKey};

/// Decrypted view over a direct-message event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Same as the underlying event id
    pub id: String,
    pub sender: PublicKey,
    pub recipient: PublicKey,
    pub created_at: u64,
    /// Plaintext, or [`DECRYPTION_PLACEHOLDER`] when `decrypted` is false
    pub plaintext: String,
    pub decrypted: bool,
}

impl DirectMessage {
    /// Decrypt `event` as seen by `signer`, who must be one of the two parties.
    ///
    /// Returns `None` when the event is not a direct message or `signer` takes
    /// no part in it. A payload that fails to decrypt still yields a message,
    /// carrying the placeholder text.
    pub fn open(event: &SignedEvent, signer: &dyn Signer) -> Option<Self> {
        if event.kind != KIND_DIRECT_MESSAGE {
            return None;
        }
        let recipient = addressed_party(event)?;
        let me = signer.public_key();
        let counterparty = if event.pubkey == me {
            recipient
        } else if recipient == me {
            event.pubkey
        } else {
            return None;
        };

        let result = crypto::decrypt(signer, &counterparty, &event.content);
        Some(Self::from_event(event, recipient, result))
    }

    /// Build the view from an already-attempted decryption
    pub fn from_event(
        event: &SignedEvent,
        recipient: PublicKey,
        plaintext: Result<String, CryptoError>,
    ) -> Self {
        let (plaintext, decrypted) = match plaintext {
            Ok(text) => (text, true),
            Err(_) => (DECRYPTION_PLACEHOLDER.to_string(), false),
        };
        Self {
            id: event.id.clone(),
            sender: event.pubkey,
            recipient,
            created_at: event.created_at,
            plaintext,
            decrypted,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        ChatId::new(&self.sender, &self.recipient)
    }

    /// The party that is not `me`
    pub fn counterparty(&self, me: &PublicKey) -> PublicKey {
        if &self.sender == me {
            self.recipient
        } else {
            self.sender
        }
    }

    /// Ordering key used by conversation views
    pub fn sort_key(&self) -> (u64, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Encrypt `plaintext` for `recipient` and sign the resulting direct-message event.
pub fn seal_direct_message(
    signer: &dyn Signer,
    recipient: &PublicKey,
    plaintext: &str,
) -> Result<SignedEvent, EventError> {
    let content = crypto::encrypt(signer, recipient, plaintext)?;
    UnsignedEvent::new(
        signer.public_key(),
        KIND_DIRECT_MESSAGE,
        vec![vec![TAG_PUBKEY.to_string(), recipient.to_hex()]],
        content,
    )
    .sign(signer)
}
