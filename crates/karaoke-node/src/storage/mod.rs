//! `SQLite` local store for the karaoke node.
//!
//! Holds the lease, the catalog mirror, unsynced play history and a small
//! key-value table for node state (device id, discovery cursor). Each
//! background unit owns its tables; cross-table writes never happen.

mod catalog_queries;
mod db;
mod history_queries;
mod lease_queries;
mod models;

pub use catalog_queries::OfflineStatus;
pub use db::{DatabaseError, LocalStore};
pub use models::*;
