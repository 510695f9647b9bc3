//! Play history relay.
//!
//! Plays are written locally first and pushed to the authority later, in
//! chunks, keyed by the lease key. Only one push runs at a time; plays
//! recorded while a push is in flight wait for the next one.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use karaoke_core::catalog::CatalogCode;
use karaoke_core::clock::SharedClock;
use karaoke_core::license::LicenseKey;
use karaoke_core::wire::{HistoryRecord, MAX_HISTORY_BATCH};

use crate::error::{NodeError, Result};
use crate::remote::RemoteStore;
use crate::storage::LocalStore;

const MIN_PUSH_PERIOD: std::time::Duration = std::time::Duration::from_millis(10);

/// Outcome of one push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    /// Rows marked synced by this push.
    pub pushed: u64,
    /// Rows the authority refused even after the placeholder retry, rows
    /// left unsynced by a failed step, and unreadable rows.
    pub errors: u64,
    /// Rows still unsynced after the push.
    pub pending: i64,
    /// No lease, so nothing could be pushed.
    pub skipped: bool,
}

/// Result of pushing one chunk.
#[derive(Debug, Default)]
struct ChunkOutcome {
    pushed: u64,
    /// Rows of the chunk left unsynced.
    failed: u64,
    /// The step that stopped the chunk early.
    error: Option<NodeError>,
}

impl ChunkOutcome {
    fn failed_with(mut self, rows: u64, error: NodeError) -> Self {
        self.failed = rows;
        self.error = Some(error);
        self
    }
}

/// History relay.
pub struct HistoryRelay {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    clock: SharedClock,
    device_id: String,
    push_lock: Mutex<()>,
}

impl HistoryRelay {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        clock: SharedClock,
        device_id: String,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            device_id,
            push_lock: Mutex::new(()),
        }
    }

    /// Record a play locally. Returns the new history id.
    pub async fn record_play(&self, codigo: &CatalogCode) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert_play(&id, codigo.as_str(), self.clock.now())
            .await?;
        debug!(%codigo, %id, "Play recorded");
        Ok(id)
    }

    /// Push every unsynced play.
    ///
    /// Records refused for an unknown code get a placeholder catalog entry
    /// on the authority and are retried once within the same call.
    pub async fn push_unsynced(&self) -> Result<PushReport> {
        let _guard = self.push_lock.lock().await;
        let mut report = PushReport::default();

        let Some(lease) = self.store.get_lease().await? else {
            report.skipped = true;
            report.pending = self.store.count_unsynced_history().await?;
            return Ok(report);
        };
        let key = lease.license_key()?;

        let snapshot = self.store.unsynced_history().await?;
        let mut records = Vec::with_capacity(snapshot.len());
        for row in &snapshot {
            match row.to_record() {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(id = %row.id, error = %e, "Skipping unreadable history row");
                    report.errors += 1;
                }
            }
        }

        for chunk in records.chunks(MAX_HISTORY_BATCH) {
            let outcome = self.push_chunk(&key, chunk).await;
            report.pushed += outcome.pushed;
            report.errors += outcome.failed;
            if let Some(e) = outcome.error {
                warn!(error = %e, rows = outcome.failed, "History push failed; will retry later");
                if e.is_network() {
                    break;
                }
            }
        }

        report.pending = self.store.count_unsynced_history().await?;
        if report.pushed > 0 {
            info!(pushed = report.pushed, pending = report.pending, "History pushed");
        }
        Ok(report)
    }

    /// Push one chunk, with a single placeholder retry for unknown codes.
    ///
    /// Rows already marked synced stay counted in `pushed` when a later step
    /// fails; only the rows left unsynced count as `failed`.
    async fn push_chunk(&self, key: &LicenseKey, chunk: &[HistoryRecord]) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        let all = chunk.len() as u64;

        let response = match self.remote.push_history(key, &self.device_id, chunk).await {
            Ok(response) => response,
            Err(e) => return outcome.failed_with(all, e.into()),
        };
        match self
            .store
            .mark_history_synced(&response.accepted, self.clock.now())
            .await
        {
            Ok(n) => outcome.pushed = n,
            Err(e) => return outcome.failed_with(all, e.into()),
        }
        if response.rejected.is_empty() {
            return outcome;
        }

        let rejected: HashSet<&str> = response.rejected.iter().map(|r| r.id.as_str()).collect();
        let retry: Vec<HistoryRecord> = chunk
            .iter()
            .filter(|r| rejected.contains(r.id.as_str()))
            .cloned()
            .collect();
        let retrying = retry.len() as u64;

        let mut codes: Vec<&CatalogCode> = retry.iter().map(|r| &r.codigo).collect();
        codes.sort_unstable();
        codes.dedup();
        for code in codes {
            if let Err(e) = self.remote.upsert_placeholder_catalog_entry(code).await {
                return outcome.failed_with(retrying, e.into());
            }
            debug!(codigo = %code, "Placeholder catalog entry requested");
        }

        let response = match self.remote.push_history(key, &self.device_id, &retry).await {
            Ok(response) => response,
            Err(e) => return outcome.failed_with(retrying, e.into()),
        };
        match self
            .store
            .mark_history_synced(&response.accepted, self.clock.now())
            .await
        {
            Ok(n) => outcome.pushed += n,
            Err(e) => return outcome.failed_with(retrying, e.into()),
        }
        outcome.failed = response.rejected.len() as u64;
        if outcome.failed > 0 {
            warn!(refused = outcome.failed, "History rows refused after placeholder retry");
        }
        outcome
    }

    /// Push every `interval` until shutdown.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval.max(MIN_PUSH_PERIOD));
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.push_unsynced().await {
                            warn!(error = %e, "Periodic history push failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("History relay shutting down");
                        return;
                    }
                }
            }
        })
    }
}
