//! Blue Karaoke core library
//!
//! Shared functionality for the node daemon and the authority server:
//! - Activation keys and the license state machine
//! - Catalog codes and media file naming
//! - Node/authority wire types
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and tracing setup

pub mod catalog;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod license;
pub mod tracing_init;
pub mod wire;

pub use catalog::{CatalogCode, CatalogEntry};
pub use config::Config;
pub use error::{Error, Result};
pub use license::{LicenseKey, ValidationError};
