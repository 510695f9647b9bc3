//! Catalog sync: discovery, downloads and the self-rescheduling loop.

mod engine;
mod scheduler;

pub use engine::{BatchReport, DiscoverReport, ReindexReport, SEARCH_LIMIT, SyncEngine};
pub use scheduler::{FailureBackoff, spawn_sync_scheduler};
