use rusqlite::params;

use courier_shared::{ChatId, SignedEvent};

use crate::database::Database;
use crate::error::Result;
use crate::models::CachedEvent;

impl Database {
    /// Insert or refresh a cached event.
    ///
    /// Events are immutable, so a second put only fills in a plaintext that
    /// was missing; a known plaintext is never replaced by `NULL`.
    pub fn upsert_event(&self, cached: &CachedEvent) -> Result<()> {
        let raw = serde_json::to_string(&cached.event)?;
        self.conn().execute(
            "INSERT INTO events (id, chat_id, pubkey, created_at, kind, raw_json, plaintext)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 plaintext = COALESCE(excluded.plaintext, events.plaintext)",
            params![
                cached.event.id,
                cached.chat_id.as_str(),
                cached.event.pubkey.to_hex(),
                cached.event.created_at as i64,
                cached.event.kind,
                raw,
                cached.plaintext,
            ],
        )?;
        Ok(())
    }

    /// Events of one conversation, oldest first with ties broken by id.
    pub fn get_events_for_chat(&self, chat_id: &ChatId) -> Result<Vec<CachedEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT raw_json, plaintext
             FROM events
             WHERE chat_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![chat_id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (raw, plaintext) = row?;
            let event: SignedEvent = serde_json::from_str(&raw)?;
            events.push(CachedEvent {
                event,
                chat_id: chat_id.clone(),
                plaintext,
            });
        }
        Ok(events)
    }

    pub fn delete_all_events(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM events", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::message::seal_direct_message;
    use courier_shared::{Identity, Signer};

    fn cached(from: &Identity, to: &Identity, text: &str, plaintext: Option<&str>) -> CachedEvent {
        let event = seal_direct_message(from, &to.public_key(), text).unwrap();
        CachedEvent {
            chat_id: ChatId::new(&from.public_key(), &to.public_key()),
            event,
            plaintext: plaintext.map(str::to_string),
        }
    }

    #[test]
    fn upsert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let row = cached(&alice, &bob, "hi", Some("hi"));

        db.upsert_event(&row).unwrap();
        let events = db.get_events_for_chat(&row.chat_id).unwrap();
        assert_eq!(events, vec![row]);
    }

    #[test]
    fn upsert_is_idempotent_and_keeps_plaintext() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let row = cached(&alice, &bob, "secret", Some("secret"));

        db.upsert_event(&row).unwrap();
        db.upsert_event(&CachedEvent {
            plaintext: None,
            ..row.clone()
        })
        .unwrap();

        let events = db.get_events_for_chat(&row.chat_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plaintext.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_plaintext_is_filled_later() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let row = cached(&alice, &bob, "late", None);

        db.upsert_event(&row).unwrap();
        db.upsert_event(&CachedEvent {
            plaintext: Some("late".into()),
            ..row.clone()
        })
        .unwrap();

        let events = db.get_events_for_chat(&row.chat_id).unwrap();
        assert_eq!(events[0].plaintext.as_deref(), Some("late"));
    }

    #[test]
    fn chat_events_are_ordered_and_scoped() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let carol = Identity::generate();

        let mut later = cached(&alice, &bob, "second", Some("second"));
        later.event.created_at = 200;
        let mut earlier = cached(&bob, &alice, "first", Some("first"));
        earlier.event.created_at = 100;
        let other = cached(&alice, &carol, "elsewhere", Some("elsewhere"));

        for row in [&later, &earlier, &other] {
            db.upsert_event(row).unwrap();
        }

        let events = db.get_events_for_chat(&later.chat_id).unwrap();
        let bodies: Vec<_> = events.iter().filter_map(|e| e.plaintext.as_deref()).collect();
        assert_eq!(bodies, vec!["first", "second"]);

        assert_eq!(db.delete_all_events().unwrap(), 3);
        assert!(db.get_events_for_chat(&later.chat_id).unwrap().is_empty());
    }
}
