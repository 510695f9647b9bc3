//! Activation key validation against the authoritative store.

use tracing::{debug, info, warn};

use karaoke_core::license::{LeaseGrant, LicenseKey, ValidationError, reconcile};

use crate::storage::{AuthorityDatabase, DatabaseError};

/// How often a validation re-reads the key after losing a race.
const MAX_ATTEMPTS: usize = 4;

/// Failure of a validation request.
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Validate `raw_key` for `device_id` at `now`, persisting any state change.
///
/// The patch is written with a compare-and-set on status, binding and
/// activation time, so of two devices racing on an unbound key exactly one
/// binds it and the other sees `MachineConflict`.
pub async fn validate_key(
    db: &AuthorityDatabase,
    raw_key: &str,
    device_id: &str,
    now: i64,
) -> Result<LeaseGrant, ValidateError> {
    let key = LicenseKey::parse(raw_key)?;
    if device_id.trim().is_empty() {
        return Err(ValidationError::InvalidFormat.into());
    }

    for attempt in 1..=MAX_ATTEMPTS {
        let Some(row) = db.get_key(key.as_str()).await? else {
            return Err(ValidationError::NotFound.into());
        };
        let record = row.to_domain()?;
        let reconciliation = reconcile(&record, device_id, now);

        if !reconciliation.patch.is_empty()
            && !db.apply_key_patch(&record, &reconciliation.patch).await?
        {
            debug!(key = %key.redacted(), attempt, "Key changed during validation, retrying");
            continue;
        }

        match &reconciliation.outcome {
            Ok(grant) if reconciliation.patch.binds() => info!(
                key = %key.redacted(),
                device_id,
                kind = %grant.kind,
                "Activation key bound to device"
            ),
            Ok(_) => debug!(key = %key.redacted(), device_id, "Activation key validated"),
            Err(err) => info!(key = %key.redacted(), device_id, error = %err.code(), "Activation key rejected"),
        }
        return reconciliation.outcome.map_err(ValidateError::from);
    }

    warn!(key = %key.redacted(), "Validation kept losing races, giving up");
    Err(DatabaseError::Query("activation key changed concurrently".into()).into())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use karaoke_core::license::{DAY_SECS, KeyKind};

    use super::*;

    const T0: i64 = 1_760_000_000;
    const KEY: &str = "ABCD-1234-EFGH-5678";

    async fn db_with_machine_key(days: i64) -> AuthorityDatabase {
        let db = AuthorityDatabase::open_in_memory().await.unwrap();
        db.insert_key(&LicenseKey::parse(KEY).unwrap(), KeyKind::Machine, Some(days), None)
            .await
            .unwrap();
        db
    }

    fn rejected(result: Result<LeaseGrant, ValidateError>) -> ValidationError {
        match result {
            Err(ValidateError::Rejected(e)) => e,
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn machine_key_scenario() {
        let db = db_with_machine_key(7).await;

        let first = validate_key(&db, KEY, "D1", T0).await.unwrap();
        assert_eq!(first.remaining.dias_restantes, Some(7));

        let later = validate_key(&db, "abcd1234efgh5678", "D1", T0 + 3 * DAY_SECS)
            .await
            .unwrap();
        assert_eq!(later.remaining.dias_restantes, Some(4));

        let other = validate_key(&db, KEY, "D2", T0 + 3 * DAY_SECS).await;
        assert_eq!(rejected(other), ValidationError::MachineConflict);
    }

    #[tokio::test]
    async fn subscription_expiry_is_persisted() {
        let db = AuthorityDatabase::open_in_memory().await.unwrap();
        let key = LicenseKey::parse(KEY).unwrap();
        db.insert_key(&key, KeyKind::Subscription, None, Some(T0)).await.unwrap();

        let first = validate_key(&db, KEY, "D1", T0 + 1).await;
        assert_eq!(rejected(first), ValidationError::Expired);
        assert_eq!(db.get_key(KEY).await.unwrap().unwrap().status, "expired");

        let second = validate_key(&db, KEY, "D1", T0 + 2).await;
        assert_eq!(rejected(second), ValidationError::NotActive);
    }

    #[tokio::test]
    async fn unknown_and_malformed_keys() {
        let db = db_with_machine_key(7).await;
        assert_eq!(
            rejected(validate_key(&db, "ZZZZ-ZZZZ-ZZZZ-ZZZZ", "D1", T0).await),
            ValidationError::NotFound
        );
        assert_eq!(
            rejected(validate_key(&db, "nope", "D1", T0).await),
            ValidationError::InvalidFormat
        );
        assert_eq!(
            rejected(validate_key(&db, KEY, "  ", T0).await),
            ValidationError::InvalidFormat
        );
    }

    #[tokio::test]
    async fn racing_devices_bind_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = AuthorityDatabase::open(&dir.path().join("authority.db")).await.unwrap();
        db.insert_key(&LicenseKey::parse(KEY).unwrap(), KeyKind::Machine, Some(7), None)
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move { validate_key(&db, KEY, &format!("D{i}"), T0).await })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(ValidateError::Rejected(ValidationError::MachineConflict)) => {}
                Err(other) => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(granted, 1);
    }
}
