//! Database connection management.
//!
//! [`Database`] owns a [`rusqlite::Connection`] and guarantees that
//! migrations have run before any other operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the cache in the platform data directory.
    ///
    /// - Linux:   `~/.local/share/courier/courier.db`
    /// - macOS:   `~/Library/Application Support/org.courier.courier/courier.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\courier\courier\data\courier.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("org", "courier", "courier").ok_or(StoreError::NoDataDir)?;
        Self::open_at(&project_dirs.data_dir().join("courier.db"))
    }

    /// Open (or create) a database at an explicit path, creating parent
    /// directories as needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        tracing::info!(path = %path.display(), "opening cache database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// A private database that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Filesystem path of the open database; `None` when in memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}
