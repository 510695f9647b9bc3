//! License reconciler.
//!
//! Answers "may this device run" from the local lease alone, and keeps that
//! lease fresh by validating against the authority in the background.
//!
//! The fast path ([`LicenseReconciler::get_local_lease`]) never touches the
//! network and never fails: a slow or broken store degrades to the last
//! snapshot, then to "not activated".

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use karaoke_core::clock::SharedClock;
use karaoke_core::config::LicenseConfig;
use karaoke_core::license::{
    DAY_SECS, HOUR_SECS, KeyKind, LicenseKey, Remaining, ValidationError, checked_expiry,
    days_rounded_up,
};

use crate::error::Result;
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::{LeaseRow, LocalStore};

/// The lease as the front-end sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Whether the device may run right now.
    pub ativada: bool,
    pub expirada: bool,
    pub key: Option<String>,
    pub kind: Option<KeyKind>,
    pub dias_restantes: Option<i64>,
    pub horas_restantes: Option<f64>,
    pub expires_at: Option<i64>,
    pub last_validated_at: Option<i64>,
    pub revoked: bool,
}

impl Lease {
    /// No usable lease.
    pub fn inactive() -> Self {
        Self::default()
    }

    /// Derive the view of `row` at `now`.
    ///
    /// Remaining time comes from `expires_at`, else from
    /// `activated_at + time_budget_days`, else from the remaining time cached
    /// at validation minus the time elapsed since. A lease with none of these
    /// has no time limit.
    ///
    /// Returns `None` when the row's figures do not fit the clock's range.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_row(row: &LeaseRow, now: i64) -> Option<Self> {
        let kind = row.kind.parse::<KeyKind>().ok();
        let expires_at = match (row.expires_at, row.activated_at, row.time_budget_days) {
            (Some(at), _, _) => Some(at),
            (None, Some(start), Some(days)) => Some(checked_expiry(start, days)?),
            _ => None,
        };

        let (remaining, expirada) = if let Some(expiry) = expires_at {
            let kind = kind.unwrap_or(KeyKind::Subscription);
            (Remaining::at(kind, Some(expiry), now), expiry <= now)
        } else if let Some(cached) = cached_remaining_secs(row).ok()? {
            let elapsed = now.checked_sub(row.last_validated_at)?.max(0);
            let left = cached.checked_sub(elapsed)?.max(0);
            let remaining = Remaining {
                dias_restantes: Some(days_rounded_up(left)),
                horas_restantes: row
                    .horas_restantes
                    .map(|_| left as f64 / HOUR_SECS as f64),
            };
            (remaining, left == 0)
        } else {
            (Remaining::default(), false)
        };

        Some(Self {
            ativada: !row.revoked && !expirada,
            expirada,
            key: Some(row.key.clone()),
            kind,
            dias_restantes: remaining.dias_restantes,
            horas_restantes: remaining.horas_restantes,
            expires_at,
            last_validated_at: Some(row.last_validated_at),
            revoked: row.revoked,
        })
    }

    /// [`Lease::from_row`], treating an out-of-range row as corrupt.
    fn from_row_or_inactive(row: &LeaseRow, now: i64) -> Self {
        Self::from_row(row, now).unwrap_or_else(|| {
            error!(
                key = %row.key,
                "Stored lease has out-of-range times; reporting not activated"
            );
            Self::inactive()
        })
    }
}

/// A cached figure that does not fit in seconds.
struct OutOfRange;

/// Remaining seconds as cached at validation time, preferring the finer
/// hour figure.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn cached_remaining_secs(row: &LeaseRow) -> std::result::Result<Option<i64>, OutOfRange> {
    if let Some(hours) = row.horas_restantes {
        let secs = (hours * HOUR_SECS as f64).round();
        if !secs.is_finite() || secs.abs() >= i64::MAX as f64 {
            return Err(OutOfRange);
        }
        return Ok(Some(secs as i64));
    }
    row.dias_restantes
        .map(|days| days.checked_mul(DAY_SECS).ok_or(OutOfRange))
        .transpose()
}

/// Outcome of the most recent background revalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RevalidationStatus {
    /// No revalidation has run yet.
    #[default]
    Never,
    /// There was no lease to revalidate.
    NoLease { at: i64 },
    /// The authority confirmed the lease.
    Valid { at: i64 },
    /// The authority refused the key.
    Rejected { at: i64, reason: ValidationError },
    /// The authority could not be reached; the lease was kept.
    Unreachable { at: i64, message: String },
    /// The local store failed.
    Failed { at: i64, message: String },
}

/// Lease owner on the node.
pub struct LicenseReconciler {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    clock: SharedClock,
    device_id: String,
    config: LicenseConfig,
    /// Last lease row read from or written to the store.
    snapshot: RwLock<Option<LeaseRow>>,
    status: RwLock<RevalidationStatus>,
}

impl LicenseReconciler {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        clock: SharedClock,
        device_id: String,
        config: LicenseConfig,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            device_id,
            config,
            snapshot: RwLock::new(None),
            status: RwLock::new(RevalidationStatus::Never),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn set_snapshot(&self, row: Option<LeaseRow>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = row;
    }

    fn snapshot(&self) -> Option<LeaseRow> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: RevalidationStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Outcome of the last background revalidation.
    pub fn last_revalidation(&self) -> RevalidationStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fast offline check. Never fails and never calls the authority.
    pub async fn get_local_lease(&self) -> Lease {
        let now = self.clock.now();
        match tokio::time::timeout(self.config.lease_read_budget(), self.store.get_lease()).await {
            Ok(Ok(Some(row))) => {
                let lease = Lease::from_row_or_inactive(&row, now);
                self.set_snapshot(Some(row));
                lease
            }
            Ok(Ok(None)) => {
                self.set_snapshot(None);
                Lease::inactive()
            }
            Ok(Err(e)) => {
                error!(error = %e, "Lease read failed; reporting not activated");
                Lease::inactive()
            }
            Err(_) => {
                warn!(
                    budget_ms = self.config.lease_read_budget_ms,
                    "Lease read exceeded budget; answering from snapshot"
                );
                self.snapshot()
                    .map_or_else(Lease::inactive, |row| Lease::from_row_or_inactive(&row, now))
            }
        }
    }

    /// Validate `raw_key` with the authority and store the resulting lease.
    ///
    /// A malformed key is refused locally. On any failure the current lease
    /// is left as it was.
    pub async fn validate_key(&self, raw_key: &str) -> Result<Lease> {
        let key = LicenseKey::parse(raw_key)?;
        let grant = self
            .remote
            .validate_activation_key(&key, &self.device_id)
            .await?;

        let row = LeaseRow::from_grant(&grant);
        self.store.put_lease(&row).await?;
        info!(key = %key.redacted(), kind = %grant.kind, "Activation key validated");

        let lease = Lease::from_row_or_inactive(&row, self.clock.now());
        self.set_snapshot(Some(row));
        Ok(lease)
    }

    /// Forget the local lease. Returns `false` if there was none.
    pub async fn remove_activation(&self) -> Result<bool> {
        let removed = self.store.delete_lease().await?;
        self.set_snapshot(None);
        if removed {
            info!("Local activation removed");
        }
        Ok(removed)
    }

    /// Revalidate the stored lease against the authority.
    ///
    /// Network failures keep the lease. Definitive refusals mark it revoked
    /// when `revoke_on_rejection` is set.
    pub async fn revalidate(&self) -> RevalidationStatus {
        let status = self.revalidate_inner().await;
        self.set_status(status.clone());
        status
    }

    async fn revalidate_inner(&self) -> RevalidationStatus {
        let at = self.clock.now();
        let row = match self.store.get_lease().await {
            Ok(Some(row)) => row,
            Ok(None) => return RevalidationStatus::NoLease { at },
            Err(e) => {
                error!(error = %e, "Lease read failed during revalidation");
                return RevalidationStatus::Failed {
                    at,
                    message: e.to_string(),
                };
            }
        };
        let key = match row.license_key() {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Stored lease key is unreadable");
                return RevalidationStatus::Failed {
                    at,
                    message: e.to_string(),
                };
            }
        };

        match self
            .remote
            .validate_activation_key(&key, &self.device_id)
            .await
        {
            Ok(grant) => {
                let fresh = LeaseRow::from_grant(&grant);
                if let Err(e) = self.store.put_lease(&fresh).await {
                    error!(error = %e, "Failed to store revalidated lease");
                    return RevalidationStatus::Failed {
                        at,
                        message: e.to_string(),
                    };
                }
                debug!(key = %key.redacted(), "Lease revalidated");
                self.set_snapshot(Some(fresh));
                RevalidationStatus::Valid { at }
            }
            Err(RemoteError::Rejected(reason)) => {
                warn!(key = %key.redacted(), %reason, "Authority refused the stored key");
                if self.config.revoke_on_rejection {
                    match self.store.mark_lease_revoked(key.as_str()).await {
                        Ok(true) => {
                            self.set_snapshot(Some(LeaseRow {
                                revoked: true,
                                ..row
                            }));
                        }
                        Ok(false) => {}
                        Err(e) => error!(error = %e, "Failed to mark lease revoked"),
                    }
                }
                RevalidationStatus::Rejected { at, reason }
            }
            Err(e) => {
                warn!(error = %e, "Lease revalidation deferred; keeping last good lease");
                RevalidationStatus::Unreachable {
                    at,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Revalidate now and then every `revalidate_interval`.
    pub fn spawn_revalidation(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.revalidate_interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.revalidate().await;
                    }
                    _ = shutdown.changed() => {
                        info!("Lease revalidation shutting down");
                        return;
                    }
                }
            }
        })
    }
}
