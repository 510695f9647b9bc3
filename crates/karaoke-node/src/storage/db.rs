//! Database connection and initialization.

pub use karaoke_core::db::DatabaseError;

karaoke_core::define_database!(LocalStore, "Local store migrations complete");
