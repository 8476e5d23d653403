//! v002 -- per-identity conversation sets.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    owner        TEXT NOT NULL,              -- local identity pubkey
    counterparty TEXT NOT NULL,
    PRIMARY KEY (owner, counterparty)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
