use serde::{Deserialize, Serialize};

use courier_shared::{ChatId, SignedEvent};

/// A direct-message event as held in the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedEvent {
    pub event: SignedEvent,
    pub chat_id: ChatId,
    /// Decrypted body, if decryption has succeeded at least once.
    pub plaintext: Option<String>,
}
