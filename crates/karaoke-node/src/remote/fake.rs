//! In-process authority for tests.
//!
//! [`FakeRemote`] keeps keys, catalog entries and media blobs in memory and
//! runs the same [`reconcile`] transition the real authority does. Failures
//! (offline, broken blobs, dropped connections) are injected per code.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use karaoke_core::catalog::{CatalogCode, CatalogEntry};
use karaoke_core::clock::SharedClock;
use karaoke_core::license::{
    ActivationKey, KeyKind, KeyStatus, LeaseGrant, LicenseKey, ValidationError, reconcile,
};
use karaoke_core::wire::{
    CatalogPage, HistoryRecord, PushHistoryResponse, RejectReason, RejectedRecord,
};

use super::{BlobBody, RemoteError, RemoteStore};

/// Bytes per chunk handed out by fake blob bodies.
const CHUNK_SIZE: usize = 4;

#[derive(Default)]
struct FakeState {
    keys: HashMap<String, ActivationKey>,
    /// Published entries by code.
    entries: BTreeMap<String, CatalogEntry>,
    blobs: HashMap<String, Bytes>,
    next_revision: i64,
    placeholders: HashSet<String>,
    history: Vec<HistoryRecord>,
    failing: HashSet<String>,
    interrupts: HashMap<String, usize>,
    ignore_ranges: bool,
    offline: bool,
    fail_placeholders: bool,
    blob_requests: Vec<(String, u64)>,
    history_pushes: usize,
}

/// Fake [`RemoteStore`].
pub struct FakeRemote {
    clock: SharedClock,
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Issue a fresh key.
    pub fn add_key(
        &self,
        kind: KeyKind,
        time_budget_days: Option<i64>,
        expires_at: Option<i64>,
    ) -> LicenseKey {
        let key = LicenseKey::generate();
        self.insert_key(ActivationKey {
            key: key.clone(),
            kind,
            status: KeyStatus::Active,
            bound_device_id: None,
            activated_at: None,
            last_used_at: None,
            time_budget_days,
            expires_at,
        });
        key
    }

    pub fn insert_key(&self, record: ActivationKey) {
        self.state()
            .keys
            .insert(record.key.as_str().to_string(), record);
    }

    pub fn key(&self, key: &LicenseKey) -> Option<ActivationKey> {
        self.state().keys.get(key.as_str()).cloned()
    }

    pub fn unbind(&self, key: &LicenseKey) {
        if let Some(record) = self.state().keys.get_mut(key.as_str()) {
            record.bound_device_id = None;
        }
    }

    pub fn revoke(&self, key: &LicenseKey) {
        if let Some(record) = self.state().keys.get_mut(key.as_str()) {
            record.status = KeyStatus::Revoked;
        }
    }

    // =========================================================================
    // Catalog and blobs
    // =========================================================================

    /// Publish (or republish) a song whose media is `body`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn add_entry(
        &self,
        code: &str,
        artista: &str,
        titulo: &str,
        body: impl Into<Bytes>,
    ) -> CatalogEntry {
        let body = body.into();
        let codigo = CatalogCode::parse(code).unwrap_or_else(|e| panic!("bad code {code}: {e}"));
        let mut state = self.state();
        state.next_revision += 1;
        let entry = CatalogEntry {
            revision: state.next_revision,
            media_ref: format!("media/{}", codigo.file_name("mp4")),
            codigo,
            artista: artista.into(),
            titulo: titulo.into(),
            size: Some(body.len() as i64),
            duration: Some(180),
        };
        state.blobs.insert(entry.media_ref.clone(), body);
        state.entries.insert(code.to_string(), entry.clone());
        entry
    }

    /// Withdraw a song: it disappears from pages and lookups, and its blob
    /// answers 404.
    pub fn remove_entry(&self, code: &str) {
        let mut state = self.state();
        if let Some(entry) = state.entries.remove(code) {
            state.blobs.remove(&entry.media_ref);
        }
    }

    /// Every transfer of `code` fails with a server error.
    pub fn fail_blob(&self, code: &str) {
        self.state().failing.insert(code.to_string());
    }

    /// The next transfer of `code` drops after `after_bytes`.
    pub fn interrupt_once(&self, code: &str, after_bytes: usize) {
        self.state().interrupts.insert(code.to_string(), after_bytes);
    }

    /// Answer range requests with the whole blob.
    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.state().ignore_ranges = ignore;
    }

    /// Every call fails as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Placeholder creation answers with a server error.
    pub fn set_fail_placeholders(&self, fail: bool) {
        self.state().fail_placeholders = fail;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn accepted_history(&self) -> Vec<HistoryRecord> {
        self.state().history.clone()
    }

    pub fn placeholders(&self) -> Vec<String> {
        let mut codes: Vec<_> = self.state().placeholders.iter().cloned().collect();
        codes.sort();
        codes
    }

    /// `(media_ref, offset)` for every blob request, in order.
    pub fn blob_requests(&self) -> Vec<(String, u64)> {
        self.state().blob_requests.clone()
    }

    pub fn history_pushes(&self) -> usize {
        self.state().history_pushes
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.state().offline {
            return Err(RemoteError::Network("fake remote is offline".into()));
        }
        Ok(())
    }
}

fn api(status: u16, message: &str) -> RemoteError {
    RemoteError::Api {
        status,
        message: message.into(),
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn validate_activation_key(
        &self,
        key: &LicenseKey,
        device_id: &str,
    ) -> Result<LeaseGrant, RemoteError> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state();
        let record = state
            .keys
            .get_mut(key.as_str())
            .ok_or(RemoteError::Rejected(ValidationError::NotFound))?;
        let result = reconcile(record, device_id, now);
        result.patch.apply(record);
        result.outcome.map_err(RemoteError::Rejected)
    }

    async fn fetch_catalog_page(&self, since: i64, limit: u32) -> Result<CatalogPage, RemoteError> {
        self.check_online()?;
        let state = self.state();
        let mut newer: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.revision > since)
            .cloned()
            .collect();
        newer.sort_by_key(|e| e.revision);

        let limit = limit.max(1) as usize;
        let has_more = newer.len() > limit;
        newer.truncate(limit);
        let next_cursor = newer.last().map_or(since, |e| e.revision);
        Ok(CatalogPage {
            entries: newer,
            next_cursor,
            has_more,
        })
    }

    async fn fetch_catalog_by_code(
        &self,
        code: &CatalogCode,
    ) -> Result<Option<CatalogEntry>, RemoteError> {
        self.check_online()?;
        Ok(self.state().entries.get(code.as_str()).cloned())
    }

    async fn fetch_blob(
        &self,
        media_ref: &str,
        offset: u64,
    ) -> Result<Box<dyn BlobBody>, RemoteError> {
        self.check_online()?;
        let mut state = self.state();
        state.blob_requests.push((media_ref.to_string(), offset));

        let code = state
            .entries
            .values()
            .find(|e| e.media_ref == media_ref)
            .map(|e| e.codigo.as_str().to_string());
        let Some(code) = code else {
            return Err(api(404, "Not Found"));
        };
        if state.failing.contains(&code) {
            return Err(api(500, "Internal Server Error"));
        }
        let body = state.blobs.get(media_ref).cloned().unwrap_or_default();
        let total = body.len() as u64;

        let resumed = offset > 0 && !state.ignore_ranges;
        if resumed && offset >= total {
            return Err(api(416, "Range Not Satisfiable"));
        }
        let start = if resumed {
            usize::try_from(offset).unwrap_or(body.len())
        } else {
            0
        };
        let drop_after = state.interrupts.remove(&code);

        Ok(Box::new(FakeBlob {
            body: body.slice(start..),
            total_len: total,
            resumed,
            drop_after,
            sent: 0,
        }))
    }

    async fn push_history(
        &self,
        key: &LicenseKey,
        _device_id: &str,
        entries: &[HistoryRecord],
    ) -> Result<PushHistoryResponse, RemoteError> {
        self.check_online()?;
        let mut state = self.state();
        state.history_pushes += 1;
        if !state.keys.contains_key(key.as_str()) {
            return Err(RemoteError::Rejected(ValidationError::NotFound));
        }

        let mut response = PushHistoryResponse::default();
        for record in entries {
            let code = record.codigo.as_str();
            if !state.entries.contains_key(code) && !state.placeholders.contains(code) {
                response.rejected.push(RejectedRecord {
                    id: record.id.clone(),
                    reason: RejectReason::UnknownCode,
                });
                continue;
            }
            if !state.history.iter().any(|h| h.id == record.id) {
                state.history.push(record.clone());
            }
            response.accepted.push(record.id.clone());
        }
        Ok(response)
    }

    async fn upsert_placeholder_catalog_entry(&self, code: &CatalogCode) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut state = self.state();
        if state.fail_placeholders {
            return Err(RemoteError::Api {
                status: 500,
                message: "placeholder store unavailable".into(),
            });
        }
        state.placeholders.insert(code.as_str().to_string());
        Ok(())
    }
}

struct FakeBlob {
    body: Bytes,
    total_len: u64,
    resumed: bool,
    drop_after: Option<usize>,
    sent: usize,
}

#[async_trait]
impl BlobBody for FakeBlob {
    fn total_len(&self) -> Option<u64> {
        Some(self.total_len)
    }

    fn resumed(&self) -> bool {
        self.resumed
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RemoteError> {
        let mut end = (self.sent + CHUNK_SIZE).min(self.body.len());
        if let Some(limit) = self.drop_after {
            if self.sent >= limit {
                return Err(RemoteError::Network("connection reset".into()));
            }
            end = end.min(limit);
        }
        if self.sent >= end {
            return Ok(None);
        }
        let chunk = self.body.slice(self.sent..end);
        self.sent = end;
        Ok(Some(chunk))
    }
}
