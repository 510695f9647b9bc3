//! Activation keys, their lifecycle, and remaining-time math.
//!
//! The authority owns [`ActivationKey`] records; the node only ever sees a
//! [`LeaseGrant`] returned by a successful validation. All status
//! transitions go through [`reconcile`], which is pure: it returns the
//! outcome together with the [`KeyPatch`] the caller has to persist.

mod key;
mod reconcile;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use key::LicenseKey;
pub use reconcile::{KeyPatch, Reconciliation, reconcile};

/// Seconds in a day.
pub const DAY_SECS: i64 = 24 * 60 * 60;
/// Seconds in an hour.
pub const HOUR_SECS: i64 = 60 * 60;

/// Why a key failed validation.
///
/// `MachineConflict` is deliberately distinct: the fix is an operator
/// unbinding the key, not typing a different one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ValidationError {
    #[error("activation key format is invalid (expected XXXX-XXXX-XXXX-XXXX)")]
    InvalidFormat,

    #[error("activation key not found")]
    NotFound,

    #[error("activation key is not active")]
    NotActive,

    #[error("activation key has expired")]
    Expired,

    #[error("activation key is already bound to another machine; ask the operator to unbind it")]
    MachineConflict,
}

impl ValidationError {
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::NotFound => "not_found",
            Self::NotActive => "not_active",
            Self::Expired => "expired",
            Self::MachineConflict => "machine_conflict",
        }
    }

    /// HTTP status both the authority and the node answer with.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InvalidFormat => 400,
            Self::NotFound => 404,
            Self::NotActive => 403,
            Self::Expired => 410,
            Self::MachineConflict => 409,
        }
    }
}

/// `start + days` in seconds, or `None` when it does not fit in an `i64`.
pub const fn checked_expiry(start: i64, days: i64) -> Option<i64> {
    match days.checked_mul(DAY_SECS) {
        Some(secs) => start.checked_add(secs),
        None => None,
    }
}

/// `start + days` in seconds, clamped to the `i64` range.
pub const fn saturating_expiry(start: i64, days: i64) -> i64 {
    start.saturating_add(days.saturating_mul(DAY_SECS))
}

/// Whole days in `secs`, rounded up.
pub const fn days_rounded_up(secs: i64) -> i64 {
    secs / DAY_SECS + if secs % DAY_SECS > 0 { 1 } else { 0 }
}

/// License kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Tied to a billing account with a fixed expiry.
    Subscription,
    /// Rolling time budget that starts at first use.
    Machine,
}

impl KeyKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Machine => "machine",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "machine" => Ok(Self::Machine),
            other => Err(format!("unknown key kind: {other}")),
        }
    }
}

/// Authority-side key status. `Expired` and `Revoked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Expired,
    Revoked,
}

impl KeyStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            other => Err(format!("unknown key status: {other}")),
        }
    }
}

/// Authoritative activation key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationKey {
    pub key: LicenseKey,
    pub kind: KeyKind,
    pub status: KeyStatus,
    pub bound_device_id: Option<String>,
    pub activated_at: Option<i64>,
    pub last_used_at: Option<i64>,
    /// Machine keys only: total days of use from first activation.
    pub time_budget_days: Option<i64>,
    /// Hard cutoff. Set for subscriptions; derived for machine keys once
    /// `activated_at` is known.
    pub expires_at: Option<i64>,
}

impl ActivationKey {
    /// The cutoff that actually governs this key, if any.
    ///
    /// Machine keys derive it from `activated_at + time_budget_days` and only
    /// fall back to a stored `expires_at` when the budget is unknown. A
    /// budget too large for the clock saturates to the far future.
    pub fn effective_expiry(&self) -> Option<i64> {
        match self.kind {
            KeyKind::Subscription => self.expires_at,
            KeyKind::Machine => match (self.activated_at, self.time_budget_days) {
                (Some(start), Some(days)) => Some(saturating_expiry(start, days)),
                _ => self.expires_at,
            },
        }
    }
}

/// Remaining time derived from an expiry and a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Remaining {
    /// Whole days left, rounded up; `0` once expired.
    pub dias_restantes: Option<i64>,
    /// Fractional hours left; only reported for machine keys.
    pub horas_restantes: Option<f64>,
}

impl Remaining {
    /// Compute remaining time for `kind` at `now`.
    ///
    /// With no expiry there is no budget to report and both fields are
    /// `None`.
    #[allow(clippy::cast_precision_loss)]
    pub fn at(kind: KeyKind, expires_at: Option<i64>, now: i64) -> Self {
        let Some(expires_at) = expires_at else {
            return Self::default();
        };
        let left = expires_at.saturating_sub(now).max(0);
        let dias = days_rounded_up(left);
        let horas = match kind {
            KeyKind::Machine => Some(left as f64 / HOUR_SECS as f64),
            KeyKind::Subscription => None,
        };
        Self {
            dias_restantes: Some(dias),
            horas_restantes: horas,
        }
    }
}

/// Successful validation payload returned to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseGrant {
    pub key: LicenseKey,
    pub kind: KeyKind,
    pub activated_at: Option<i64>,
    pub time_budget_days: Option<i64>,
    pub expires_at: Option<i64>,
    #[serde(flatten)]
    pub remaining: Remaining,
    pub validated_at: i64,
}
