//! Catalog mirror and media downloads.
//!
//! Discovery pages remote metadata into the local catalog. Downloads then
//! fill in `local_path` a few entries at a time: each blob is streamed into
//! `<dest>.part` (resuming from a partial file when there is one), checked
//! against the announced length, synced, and renamed into place. A file
//! under its final name is therefore always complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

use karaoke_core::catalog::{CatalogCode, PART_SUFFIX, parse_media_file_name};
use karaoke_core::clock::SharedClock;
use karaoke_core::config::{OrphanPolicy, SyncConfig};

use crate::error::{NodeError, Result};
use crate::remote::{BlobBody, RemoteError, RemoteStore};
use crate::storage::{CatalogRow, LocalStore, OfflineStatus};

/// `node_state` key holding the discovery cursor.
const CURSOR_KEY: &str = "catalog_cursor";

/// Search results are capped at this many rows.
pub const SEARCH_LIMIT: u32 = 50;

/// Result of one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverReport {
    pub pages: u32,
    pub upserted: u32,
    pub cursor: i64,
}

/// Result of one download batch. Per-item failures are counted, never
/// raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub downloaded: u32,
    /// Eligible entries still pending after the batch.
    pub remaining: i64,
    pub errors: u32,
    /// Codes found to be withdrawn by the authority during this batch.
    pub orphaned: Vec<String>,
    /// The batch stopped early because downloads were blocked.
    pub blocked: bool,
}

/// Result of a media root scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexReport {
    pub scanned: u32,
    pub materialized: u32,
    pub already_known: u32,
    /// Files whose code the authority does not publish.
    pub missing_remote: Vec<String>,
    pub errors: u32,
}

enum ItemOutcome {
    Downloaded,
    /// `true` the first time the code is seen withdrawn.
    Orphaned(bool),
}

/// Catalog sync engine.
pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    clock: SharedClock,
    media_root: PathBuf,
    config: SyncConfig,
    blocked: watch::Sender<bool>,
    wake: Notify,
    /// Serializes batches from the scheduler and the local API.
    batch_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        clock: SharedClock,
        media_root: PathBuf,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            media_root,
            config,
            blocked: watch::Sender::new(false),
            wake: Notify::new(),
            batch_lock: Mutex::new(()),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn hide_orphans(&self) -> bool {
        self.config.orphan_policy == OrphanPolicy::Hide
    }

    // =========================================================================
    // Download blocking
    // =========================================================================

    /// Stop starting new transfers. A transfer already running completes.
    pub fn block_downloads(&self) {
        if !self.blocked.send_replace(true) {
            debug!("Downloads blocked");
        }
    }

    pub fn unblock_downloads(&self) {
        if self.blocked.send_replace(false) {
            debug!("Downloads unblocked");
        }
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.borrow()
    }

    pub fn subscribe_blocked(&self) -> watch::Receiver<bool> {
        self.blocked.subscribe()
    }

    /// Ask the scheduler for a sync pass as soon as it is idle.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn sync_requested(&self) {
        self.wake.notified().await;
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Page remote metadata into the local catalog from the stored cursor.
    pub async fn discover(&self) -> Result<DiscoverReport> {
        let mut cursor = match self.store.get_state(CURSOR_KEY).await? {
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(%value, "Unreadable catalog cursor; restarting discovery");
                0
            }),
            None => 0,
        };
        let mut report = DiscoverReport::default();

        loop {
            let page = self
                .remote
                .fetch_catalog_page(cursor, self.config.page_limit)
                .await?;
            report.pages += 1;

            let now = self.clock.now();
            for entry in &page.entries {
                self.store.upsert_remote_entry(entry, now).await?;
                report.upserted += 1;
            }
            if page.next_cursor > cursor {
                cursor = page.next_cursor;
                self.store.set_state(CURSOR_KEY, &cursor.to_string()).await?;
            }
            if !page.has_more || page.entries.is_empty() {
                break;
            }
        }

        report.cursor = cursor;
        if report.upserted > 0 {
            info!(upserted = report.upserted, cursor, "Catalog discovery complete");
        }
        Ok(report)
    }

    // =========================================================================
    // Pending set
    // =========================================================================

    /// Clear `local_path` on rows whose file is gone. Returns how many.
    pub async fn reset_vanished(&self) -> Result<u32> {
        let mut reset = 0;
        for row in self.store.rows_with_local_path().await? {
            let Some(path) = row.local_path() else {
                continue;
            };
            if !fs::try_exists(&path).await.unwrap_or(false) {
                warn!(codigo = %row.codigo, path = %path.display(), "Media file vanished; will fetch again");
                self.store.clear_local_path(&row.codigo).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Rows known but not on disk, after resetting vanished files.
    pub async fn list_pending(&self) -> Result<Vec<CatalogRow>> {
        self.reset_vanished().await?;
        Ok(self.store.list_pending().await?)
    }

    // =========================================================================
    // Reindex
    // =========================================================================

    /// Adopt media files already present under the media root.
    pub async fn reindex(&self) -> Result<ReindexReport> {
        let mut report = ReindexReport::default();
        let mut dir = match fs::read_dir(&self.media_root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(code) = name.to_str().and_then(parse_media_file_name) else {
                continue;
            };
            let meta = item.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            report.scanned += 1;

            let path = item.path();
            match self.adopt(&code, &path, meta.len()).await {
                Ok(Some(true)) => report.materialized += 1,
                Ok(Some(false)) => report.already_known += 1,
                Ok(None) => {
                    if !report.missing_remote.iter().any(|c| c == code.as_str()) {
                        warn!(codigo = %code, "Local media has no catalog entry on the authority");
                        report.missing_remote.push(code.to_string());
                    }
                }
                Err(e) => {
                    warn!(codigo = %code, error = %e, "Could not index local media");
                    report.errors += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            materialized = report.materialized,
            missing = report.missing_remote.len(),
            "Media root reindexed"
        );
        Ok(report)
    }

    /// `Some(true)` if a row now points at `path`, `Some(false)` if one
    /// already did, `None` if the code is unknown remotely.
    #[allow(clippy::cast_possible_wrap)]
    async fn adopt(&self, code: &CatalogCode, path: &Path, size: u64) -> Result<Option<bool>> {
        let existing = self.store.get_catalog_row(code).await?;
        if let Some(row) = &existing
            && let Some(known) = row.local_path()
            && fs::try_exists(&known).await.unwrap_or(false)
        {
            return Ok(Some(false));
        }

        let path_str = path.to_string_lossy();
        let now = self.clock.now();
        match self.remote.fetch_catalog_by_code(code).await {
            Ok(Some(entry)) => {
                self.store
                    .upsert_local_entry(&entry, &path_str, size as i64, now)
                    .await?;
                Ok(Some(true))
            }
            Ok(None) => Ok(None),
            // Offline: a row we already mirrored is enough to adopt the file.
            Err(e) if e.is_network() && existing.is_some() => {
                self.store
                    .mark_synced(code.as_str(), &path_str, size as i64, now)
                    .await?;
                Ok(Some(true))
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// Download up to `n` eligible pending entries, one after another.
    pub async fn download_batch(&self, n: u32) -> Result<BatchReport> {
        let _guard = self.batch_lock.lock().await;
        self.reset_vanished().await?;

        let mut report = BatchReport::default();
        let rows = if self.is_blocked() {
            report.blocked = true;
            Vec::new()
        } else {
            self.store.eligible_pending(n).await?
        };

        for row in rows {
            if self.is_blocked() {
                report.blocked = true;
                break;
            }
            match self.fetch_one(&row).await {
                Ok(ItemOutcome::Downloaded) => report.downloaded += 1,
                Ok(ItemOutcome::Orphaned(first)) => {
                    if first {
                        report.orphaned.push(row.codigo.clone());
                    }
                }
                Err(e) => {
                    warn!(codigo = %row.codigo, error = %e, "Download failed");
                    report.errors += 1;
                    self.store.record_failure(&row.codigo, &e.to_string()).await?;
                }
            }
        }

        report.remaining = self.store.count_eligible_pending().await?;
        debug!(
            downloaded = report.downloaded,
            remaining = report.remaining,
            errors = report.errors,
            "Batch finished"
        );
        Ok(report)
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn fetch_one(&self, row: &CatalogRow) -> Result<ItemOutcome> {
        let file_name = row.file_name();
        let dest = self.media_root.join(&file_name);

        if let Ok(meta) = fs::metadata(&dest).await {
            self.store
                .mark_synced(&row.codigo, &dest.to_string_lossy(), meta.len() as i64, self.clock.now())
                .await?;
            debug!(codigo = %row.codigo, "Media already on disk");
            return Ok(ItemOutcome::Downloaded);
        }

        fs::create_dir_all(&self.media_root).await?;
        let part = self.media_root.join(format!("{file_name}{PART_SUFFIX}"));
        let offset = fs::metadata(&part).await.map_or(0, |m| m.len());

        let blob = match self.remote.fetch_blob(&row.media_ref, offset).await {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => return self.handle_missing(row, &part, e).await,
            Err(e) if e.is_range_not_satisfiable() => {
                let _ = fs::remove_file(&part).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let written = self.write_part(&part, offset, blob, row.size).await?;

        fs::rename(&part, &dest).await?;
        // A verified file stays even if the row update fails; the next batch
        // adopts it without a second transfer.
        self.store
            .mark_synced(&row.codigo, &dest.to_string_lossy(), written as i64, self.clock.now())
            .await?;

        info!(codigo = %row.codigo, bytes = written, resumed_from = offset, "Media downloaded");
        Ok(ItemOutcome::Downloaded)
    }

    /// Stream `blob` into `part`, verify the length and sync to disk.
    async fn write_part(
        &self,
        part: &Path,
        offset: u64,
        mut blob: Box<dyn BlobBody>,
        catalog_size: Option<i64>,
    ) -> Result<u64> {
        let (mut file, mut written) = if blob.resumed() {
            let file = OpenOptions::new().append(true).open(part).await?;
            (file, offset)
        } else {
            (fs::File::create(part).await?, 0)
        };

        let copied: Result<()> = async {
            while let Some(chunk) = blob.next_chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            Ok(())
        }
        .await;
        // Flush what arrived so an interrupted transfer can resume from it.
        file.flush().await?;
        copied?;

        let expected = blob
            .total_len()
            .or_else(|| catalog_size.and_then(|s| u64::try_from(s).ok()));
        if let Some(expected) = expected
            && expected != written
        {
            drop(file);
            let _ = fs::remove_file(part).await;
            return Err(NodeError::SizeMismatch {
                expected,
                actual: written,
            });
        }
        if let (Some(total), Some(size)) = (blob.total_len(), catalog_size)
            && u64::try_from(size).ok() != Some(total)
        {
            warn!(total, size, "Blob length differs from catalog size");
        }

        file.sync_all().await?;
        Ok(written)
    }

    /// A 404 on the blob: check whether the authority still publishes the
    /// code at all.
    async fn handle_missing(
        &self,
        row: &CatalogRow,
        part: &Path,
        not_found: RemoteError,
    ) -> Result<ItemOutcome> {
        let code = row.code()?;
        if let Some(entry) = self.remote.fetch_catalog_by_code(&code).await? {
            // Still published, most likely under a new reference.
            self.store.upsert_remote_entry(&entry, self.clock.now()).await?;
            return Err(not_found.into());
        }

        let _ = fs::remove_file(part).await;
        let first = match self.config.orphan_policy {
            OrphanPolicy::KeepPending | OrphanPolicy::Hide => {
                self.store.mark_orphaned(&row.codigo, self.clock.now()).await?
            }
            OrphanPolicy::Delete => self.store.delete_catalog_row(&row.codigo).await?,
        };
        if first {
            warn!(
                codigo = %row.codigo,
                policy = %self.config.orphan_policy,
                "Catalog entry withdrawn by the authority"
            );
        }
        Ok(ItemOutcome::Orphaned(first))
    }

    // =========================================================================
    // Local queries
    // =========================================================================

    /// Totals over the local mirror. No network.
    pub async fn offline_status(&self) -> Result<OfflineStatus> {
        Ok(self.store.offline_status(self.hide_orphans()).await?)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<CatalogRow>> {
        Ok(self
            .store
            .search_catalog(query, SEARCH_LIMIT, self.hide_orphans())
            .await?)
    }

    pub async fn lookup(&self, code: &CatalogCode) -> Result<Option<CatalogRow>> {
        let row = self.store.get_catalog_row(code).await?;
        Ok(row.filter(|r| !(self.hide_orphans() && r.orphaned_at.is_some())))
    }

    /// A random downloaded row, for "surprise me" playback.
    pub async fn random_local(&self) -> Result<Option<CatalogRow>> {
        let hide = self.hide_orphans();
        let total = self.store.offline_status(hide).await?.total_local;
        if total == 0 {
            return Ok(None);
        }
        let offset = rand::thread_rng().gen_range(0..total);
        Ok(self.store.local_row_at(offset, hide).await?)
    }

    /// Path of the media file for `code` when it is on disk.
    pub async fn local_media(&self, code: &CatalogCode) -> Result<Option<PathBuf>> {
        let Some(path) = self.lookup(code).await?.and_then(|r| r.local_path) else {
            return Ok(None);
        };
        let path = PathBuf::from(path);
        Ok(fs::try_exists(&path).await?.then_some(path))
    }
}
