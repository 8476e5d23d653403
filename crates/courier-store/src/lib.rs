//! # courier-store
//!
//! Durable local cache for direct-message events and conversation sets.
//!
//! [`Database`] wraps a `rusqlite::Connection`, runs schema migrations on
//! open and exposes typed helpers. The engine talks to the cache through the
//! [`MessageCache`] trait, implemented by [`SqliteCache`] and by the
//! in-memory [`MemoryCache`].

pub mod cache;
pub mod conversations;
pub mod database;
pub mod events;
pub mod migrations;
pub mod models;

mod error;

pub use cache::{MemoryCache, MessageCache, SqliteCache};
pub use database::Database;
pub use error::StoreError;
pub use models::CachedEvent;
