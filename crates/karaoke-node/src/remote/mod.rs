//! Access to the authority.
//!
//! [`RemoteStore`] is the only path from the node to the network. The
//! production implementation is [`HttpRemote`]; tests use
//! [`fake::FakeRemote`] behind the `test-utils` feature.

mod http;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use karaoke_core::catalog::{CatalogCode, CatalogEntry};
use karaoke_core::license::{LeaseGrant, LicenseKey, ValidationError};
use karaoke_core::wire::{CatalogPage, HistoryRecord, PushHistoryResponse};

pub use http::HttpRemote;

/// Remote access errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The authority could not be reached.
    #[error("Network unavailable: {0}")]
    Network(String),

    /// The authority answered with an error status.
    #[error("Remote error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The authority answered with a body we could not read.
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Definitive validation refusal.
    #[error(transparent)]
    Rejected(ValidationError),
}

impl RemoteError {
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// The server could not satisfy the requested byte range.
    pub const fn is_range_not_satisfiable(&self) -> bool {
        matches!(self, Self::Api { status: 416, .. })
    }
}

/// A blob response being streamed.
#[async_trait]
pub trait BlobBody: Send {
    /// Total blob length, when the server announced it.
    fn total_len(&self) -> Option<u64>;

    /// Whether the body starts at the requested offset. `false` means the
    /// server ignored the range and is sending the whole blob.
    fn resumed(&self) -> bool;

    /// Next chunk, or `None` at the end of the body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RemoteError>;
}

/// Operations the node needs from the authority.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn validate_activation_key(
        &self,
        key: &LicenseKey,
        device_id: &str,
    ) -> Result<LeaseGrant, RemoteError>;

    async fn fetch_catalog_page(&self, since: i64, limit: u32) -> Result<CatalogPage, RemoteError>;

    /// `Ok(None)` when the authority does not publish the code.
    async fn fetch_catalog_by_code(
        &self,
        code: &CatalogCode,
    ) -> Result<Option<CatalogEntry>, RemoteError>;

    /// Stream a blob starting at `offset`.
    async fn fetch_blob(
        &self,
        media_ref: &str,
        offset: u64,
    ) -> Result<Box<dyn BlobBody>, RemoteError>;

    async fn push_history(
        &self,
        key: &LicenseKey,
        device_id: &str,
        entries: &[HistoryRecord],
    ) -> Result<PushHistoryResponse, RemoteError>;

    async fn upsert_placeholder_catalog_entry(&self, code: &CatalogCode) -> Result<(), RemoteError>;
}
