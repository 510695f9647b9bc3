//! The activation key state machine.
//!
//! [`reconcile`] never touches storage. Callers apply the returned
//! [`KeyPatch`] (the authority does it with a compare-and-set on the binding)
//! and hand the outcome back to the device.

use super::{
    ActivationKey, KeyKind, KeyStatus, LeaseGrant, Remaining, ValidationError, saturating_expiry,
};

/// Field updates produced by a validation attempt.
///
/// `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPatch {
    pub status: Option<KeyStatus>,
    pub bound_device_id: Option<String>,
    pub activated_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub last_used_at: Option<i64>,
}

impl KeyPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether persisting this patch claims an unbound key for a device.
    pub const fn binds(&self) -> bool {
        self.bound_device_id.is_some()
    }

    /// Apply the patch to an in-memory record.
    pub fn apply(&self, record: &mut ActivationKey) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(device) = &self.bound_device_id {
            record.bound_device_id = Some(device.clone());
        }
        if let Some(at) = self.activated_at {
            record.activated_at = Some(at);
        }
        if let Some(at) = self.expires_at {
            record.expires_at = Some(at);
        }
        if let Some(at) = self.last_used_at {
            record.last_used_at = Some(at);
        }
    }
}

/// Result of running one validation against a key record.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub outcome: Result<LeaseGrant, ValidationError>,
    pub patch: KeyPatch,
}

impl Reconciliation {
    fn rejected(error: ValidationError) -> Self {
        Self {
            outcome: Err(error),
            patch: KeyPatch::default(),
        }
    }
}

/// Validate `record` for `device_id` at `now`.
///
/// Order of checks:
/// 1. bound to another device: `MachineConflict` (reported even when the key
///    is no longer active, so a second machine always sees the binding)
/// 2. not active: `NotActive`
/// 3. expiry reached: flip to `expired`, `Expired`
/// 4. machine key never used: start the clock now
/// 5. pass: bind if unbound, touch `last_used_at`
pub fn reconcile(record: &ActivationKey, device_id: &str, now: i64) -> Reconciliation {
    if let Some(bound) = &record.bound_device_id
        && bound != device_id
    {
        return Reconciliation::rejected(ValidationError::MachineConflict);
    }

    if record.status != KeyStatus::Active {
        return Reconciliation::rejected(ValidationError::NotActive);
    }

    let mut patch = KeyPatch::default();

    match record.kind {
        KeyKind::Subscription => {
            if record.expires_at.is_some_and(|at| at <= now) {
                patch.status = Some(KeyStatus::Expired);
                return Reconciliation {
                    outcome: Err(ValidationError::Expired),
                    patch,
                };
            }
        }
        KeyKind::Machine => {
            if record.activated_at.is_none() {
                patch.activated_at = Some(now);
                patch.expires_at = record.time_budget_days.map(|days| saturating_expiry(now, days));
            } else if record.effective_expiry().is_some_and(|at| at <= now) {
                patch.status = Some(KeyStatus::Expired);
                return Reconciliation {
                    outcome: Err(ValidationError::Expired),
                    patch,
                };
            }
        }
    }

    if record.bound_device_id.is_none() {
        patch.bound_device_id = Some(device_id.to_string());
    }
    patch.last_used_at = Some(now);

    let mut updated = record.clone();
    patch.apply(&mut updated);
    let expires_at = updated.effective_expiry();

    Reconciliation {
        outcome: Ok(LeaseGrant {
            key: updated.key,
            kind: updated.kind,
            activated_at: updated.activated_at,
            time_budget_days: updated.time_budget_days,
            expires_at,
            remaining: Remaining::at(updated.kind, expires_at, now),
            validated_at: now,
        }),
        patch,
    }
}
