//! Blue Karaoke node
//!
//! The desktop-side daemon:
//! - Offline license checks against a locally cached lease
//! - Catalog mirroring and resumable media downloads
//! - Play history relay to the authority
//! - Play queue and playback session
//! - Local HTTP API for the front-end

pub mod error;
pub mod history;
pub mod license;
pub mod node;
pub mod player;
pub mod queue;
pub mod remote;
pub mod server;
pub mod storage;
pub mod sync;

pub use error::{NodeError, Result};
pub use node::Node;
