//! Blue Karaoke authority
//!
//! The authoritative store for activation keys, the published catalog and
//! play history, served to nodes over HTTP/JSON.

pub mod routes;
pub mod storage;
pub mod validation;
