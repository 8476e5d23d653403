//! The cache seam used by the message engine.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use courier_shared::{ChatId, PublicKey, SignedEvent};

use crate::database::Database;
use crate::error::Result;
use crate::models::CachedEvent;

/// Durable store for direct-message events and per-identity conversation
/// sets. Implementations must be safe to share across tasks.
pub trait MessageCache: Send + Sync {
    /// Store an event. Re-putting a known event only fills in a missing
    /// plaintext.
    fn put_event(&self, event: &SignedEvent, chat_id: &ChatId, plaintext: Option<&str>) -> Result<()>;

    /// Events of one conversation ordered by `(created_at, id)`.
    fn events_by_chat(&self, chat_id: &ChatId) -> Result<Vec<CachedEvent>>;

    /// Known counterparties of `owner`; empty when nothing was recorded.
    fn conversations(&self, owner: &PublicKey) -> Result<BTreeSet<PublicKey>>;

    /// Merge counterparties into the owner's set.
    fn put_conversations(&self, owner: &PublicKey, counterparties: &BTreeSet<PublicKey>) -> Result<()>;

    /// Remove every cached event and conversation.
    fn clear(&self) -> Result<()>;
}

/// [`MessageCache`] over the SQLite [`Database`].
pub struct SqliteCache {
    db: Mutex<Database>,
}

impl SqliteCache {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::new()?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageCache for SqliteCache {
    fn put_event(&self, event: &SignedEvent, chat_id: &ChatId, plaintext: Option<&str>) -> Result<()> {
        self.db().upsert_event(&CachedEvent {
            event: event.clone(),
            chat_id: chat_id.clone(),
            plaintext: plaintext.map(str::to_string),
        })
    }

    fn events_by_chat(&self, chat_id: &ChatId) -> Result<Vec<CachedEvent>> {
        self.db().get_events_for_chat(chat_id)
    }

    fn conversations(&self, owner: &PublicKey) -> Result<BTreeSet<PublicKey>> {
        self.db().get_conversations(owner)
    }

    fn put_conversations(&self, owner: &PublicKey, counterparties: &BTreeSet<PublicKey>) -> Result<()> {
        self.db().add_conversations(owner, counterparties)
    }

    fn clear(&self) -> Result<()> {
        let db = self.db();
        let events = db.delete_all_events()?;
        let conversations = db.delete_all_conversations()?;
        tracing::info!(events, conversations, "cache cleared");
        Ok(())
    }
}

/// Volatile [`MessageCache`], for tests and for running without a disk.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, CachedEvent>,
    conversations: HashMap<PublicKey, BTreeSet<PublicKey>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageCache for MemoryCache {
    fn put_event(&self, event: &SignedEvent, chat_id: &ChatId, plaintext: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .events
            .entry(event.id.clone())
            .or_insert_with(|| CachedEvent {
                event: event.clone(),
                chat_id: chat_id.clone(),
                plaintext: None,
            });
        if let Some(plaintext) = plaintext {
            entry.plaintext = Some(plaintext.to_string());
        }
        Ok(())
    }

    fn events_by_chat(&self, chat_id: &ChatId) -> Result<Vec<CachedEvent>> {
        let mut events: Vec<CachedEvent> = self
            .state()
            .events
            .values()
            .filter(|cached| &cached.chat_id == chat_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (a.event.created_at, &a.event.id).cmp(&(b.event.created_at, &b.event.id))
        });
        Ok(events)
    }

    fn conversations(&self, owner: &PublicKey) -> Result<BTreeSet<PublicKey>> {
        Ok(self.state().conversations.get(owner).cloned().unwrap_or_default())
    }

    fn put_conversations(&self, owner: &PublicKey, counterparties: &BTreeSet<PublicKey>) -> Result<()> {
        self.state()
            .conversations
            .entry(*owner)
            .or_default()
            .extend(counterparties.iter().copied());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state();
        state.events.clear();
        state.conversations.clear();
        Ok(())
    }
}
