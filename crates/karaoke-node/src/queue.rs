//! "Play next" queue.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use karaoke_core::catalog::CatalogCode;

/// A queued song. Metadata is optional; codes typed on the keypad arrive
/// without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub codigo: CatalogCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub titulo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artista: Option<String>,
}

impl QueueItem {
    pub const fn bare(codigo: CatalogCode) -> Self {
        Self {
            codigo,
            titulo: None,
            artista: None,
        }
    }
}

/// FIFO queue. Duplicates are allowed.
#[derive(Debug, Default)]
pub struct PlayQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl PlayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the back. Returns the new length.
    pub fn push(&self, item: QueueItem) -> usize {
        let mut items = self.items();
        items.push_back(item);
        items.len()
    }

    /// Remove and return the front item.
    pub fn pop(&self) -> Option<QueueItem> {
        self.items().pop_front()
    }

    /// The front item, left in place.
    pub fn next(&self) -> Option<QueueItem> {
        self.items().front().cloned()
    }

    pub fn clear(&self) {
        self.items().clear();
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.items().iter().cloned().collect()
    }
}
