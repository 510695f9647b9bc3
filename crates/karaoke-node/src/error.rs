//! Node error type.

use thiserror::Error;

use karaoke_core::license::ValidationError;

use crate::remote::RemoteError;
use crate::storage::DatabaseError;

/// Errors surfaced by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Remote(RemoteError),

    #[error("Local store error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid catalog code: {0}")]
    InvalidCode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RemoteError> for NodeError {
    /// Definitive refusals are validation errors whichever side produced them.
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Rejected(v) => Self::Validation(v),
            other => Self::Remote(other),
        }
    }
}

impl From<karaoke_core::Error> for NodeError {
    fn from(e: karaoke_core::Error) -> Self {
        match e {
            karaoke_core::Error::InvalidCode(msg) => Self::InvalidCode(msg),
            karaoke_core::Error::Io(io) => Self::Io(io),
            other => Self::Config(other.to_string()),
        }
    }
}

impl NodeError {
    /// Whether the failure was the authority being unreachable.
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::Network(_)))
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
