//! In-memory conversation index.

use std::collections::{BTreeSet, HashMap};

use courier_shared::{ChatId, DirectMessage, PublicKey};

/// Conversations keyed by [`ChatId`], each ordered by `(created_at, id)`.
///
/// Every message id is held at most once. The index only shrinks through
/// [`ConversationIndex::clear`].
#[derive(Debug, Default)]
pub struct ConversationIndex {
    chats: HashMap<ChatId, Vec<DirectMessage>>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `message` in order. Returns `false` if the id was already
    /// present; a stored placeholder is upgraded when `message` decrypted.
    pub fn insert(&mut self, message: DirectMessage) -> bool {
        let chat = self.chats.entry(message.chat_id()).or_default();
        match chat.binary_search_by(|m| m.sort_key().cmp(&message.sort_key())) {
            Ok(pos) => {
                let existing = &mut chat[pos];
                if !existing.decrypted && message.decrypted {
                    *existing = message;
                }
                false
            }
            Err(pos) => {
                chat.insert(pos, message);
                true
            }
        }
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = DirectMessage>) -> usize {
        messages
            .into_iter()
            .filter(|m| self.insert(m.clone()))
            .count()
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<DirectMessage> {
        self.chats.get(chat_id).cloned().unwrap_or_default()
    }

    /// Counterparties of `me` across indexed conversations.
    pub fn counterparties(&self, me: &PublicKey) -> BTreeSet<PublicKey> {
        self.chats
            .keys()
            .filter_map(|chat| chat.counterpart(me))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chats.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn clear(&mut self) {
        self.chats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::constants::DECRYPTION_PLACEHOLDER;
    use courier_shared::{Identity, Signer};

    fn message(from: &PublicKey, to: &PublicKey, id: &str, created_at: u64) -> DirectMessage {
        DirectMessage {
            id: id.to_string(),
            sender: *from,
            recipient: *to,
            created_at,
            plaintext: format!("body {id}"),
            decrypted: true,
        }
    }

    #[test]
    fn test_orders_by_time_then_id() {
        let a = Identity::generate().public_key();
        let b = Identity::generate().public_key();
        let mut index = ConversationIndex::new();

        index.insert(message(&a, &b, "cc", 20));
        index.insert(message(&b, &a, "bb", 10));
        index.insert(message(&a, &b, "aa", 20));

        let ids: Vec<String> = index
            .messages(&ChatId::new(&a, &b))
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["bb", "aa", "cc"]);
    }

    #[test]
    fn test_duplicate_ids_are_ignored() {
        let a = Identity::generate().public_key();
        let b = Identity::generate().public_key();
        let mut index = ConversationIndex::new();

        assert!(index.insert(message(&a, &b, "aa", 1)));
        assert!(!index.insert(message(&a, &b, "aa", 1)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_placeholder_upgraded_by_decrypted_copy() {
        let a = Identity::generate().public_key();
        let b = Identity::generate().public_key();
        let mut index = ConversationIndex::new();

        let mut failed = message(&a, &b, "aa", 1);
        failed.plaintext = DECRYPTION_PLACEHOLDER.to_string();
        failed.decrypted = false;
        index.insert(failed);
        index.insert(message(&a, &b, "aa", 1));

        let stored = &index.messages(&ChatId::new(&a, &b))[0];
        assert!(stored.decrypted);
        assert_eq!(stored.plaintext, "body aa");
    }

    #[test]
    fn test_counterparties_and_clear() {
        let me = Identity::generate().public_key();
        let b = Identity::generate().public_key();
        let c = Identity::generate().public_key();
        let mut index = ConversationIndex::new();

        assert_eq!(
            index.extend([message(&me, &b, "1", 1), message(&c, &me, "2", 2)]),
            2
        );
        assert_eq!(index.counterparties(&me), BTreeSet::from([b, c]));

        index.clear();
        assert!(index.is_empty());
        assert!(index.messages(&ChatId::new(&me, &b)).is_empty());
    }
}
