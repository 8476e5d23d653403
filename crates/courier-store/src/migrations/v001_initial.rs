//! v001 -- cached direct-message events.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY NOT NULL,   -- hex event id
    chat_id     TEXT NOT NULL,               -- sorted "pubkey:pubkey"
    pubkey      TEXT NOT NULL,               -- author
    created_at  INTEGER NOT NULL,            -- unix seconds
    kind        INTEGER NOT NULL,
    raw_json    TEXT NOT NULL,               -- the signed event as received
    plaintext   TEXT                         -- NULL until decrypted
);

CREATE INDEX IF NOT EXISTS idx_events_chat_ts
    ON events(chat_id, created_at, id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
