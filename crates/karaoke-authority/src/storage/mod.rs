//! `SQLite` storage for the karaoke authority.
//!
//! Provides persistence for activation keys, the published catalog and the
//! play history pushed by nodes.

mod db;
mod models;
mod queries;

pub use db::{AuthorityDatabase, DatabaseError};
pub use models::*;
