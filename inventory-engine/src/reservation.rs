//! Reservation lifecycle: create, commit, release, expire.

use std::sync::Arc;

use chrono::{Duration, Utc};
use shared::{ReservationLine, ReservationStatus};
use tracing::info;
use uuid::Uuid;

use crate::availability;
use crate::store::{LedgerStore, ReserveOutcome};
use crate::{Error, Result};

/// How long an uncommitted reservation holds its units.
pub const RESERVATION_TTL_MINUTES: i64 = 15;

/// Creates and transitions per-unit reservation rows. Each reservation row
/// claims exactly one unit, so partial release never needs row surgery.
pub struct ReservationManager {
    store: Arc<dyn LedgerStore>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Reserves every requested line or nothing at all.
    ///
    /// Availability is checked twice: once up front for a cheap early
    /// rejection, and again by the store inside the transaction that inserts
    /// the rows, so concurrent checkouts cannot both claim the last unit.
    pub async fn reserve(
        &self,
        order_id: Option<Uuid>,
        lines: &[ReservationLine],
    ) -> Result<Vec<Uuid>> {
        if lines.is_empty() {
            return Err(Error::Validation("no items to reserve".into()));
        }
        for line in lines {
            if line.quantity < 1 {
                return Err(Error::Validation(format!(
                    "invalid quantity {} for variant {}",
                    line.quantity, line.variant_id
                )));
            }
        }

        // Demand is summed per variant so a request that splits one variant
        // across several lines is checked against its combined quantity.
        let mut requested: Vec<(Uuid, i64)> = Vec::new();
        for line in lines {
            match requested.iter_mut().find(|(id, _)| *id == line.variant_id) {
                Some((_, total)) => *total += i64::from(line.quantity),
                None => requested.push((line.variant_id, i64::from(line.quantity))),
            }
        }
        for (variant_id, total) in &requested {
            let available = availability::available(self.store.as_ref(), *variant_id).await?;
            if available < *total {
                return Err(Error::InsufficientStock {
                    variant_id: *variant_id,
                    requested: *total,
                    available,
                });
            }
        }

        let expires_at = Utc::now() + Duration::minutes(RESERVATION_TTL_MINUTES);
        match self.store.reserve_rows(lines, order_id, expires_at).await? {
            ReserveOutcome::Reserved(ids) => {
                info!(count = ids.len(), ?order_id, "reserved units");
                Ok(ids)
            }
            ReserveOutcome::Insufficient {
                variant_id,
                requested,
                available,
            } => Err(Error::InsufficientStock {
                variant_id,
                requested,
                available,
            }),
        }
    }

    /// Active -> committed for the order. Committing an order with no active
    /// reservations is a no-op, which makes retries safe.
    pub async fn commit(&self, order_id: Uuid) -> Result<usize> {
        let affected = self
            .store
            .transition_order_reservations(
                order_id,
                ReservationStatus::Active,
                ReservationStatus::Committed,
            )
            .await?;
        if affected > 0 {
            info!(%order_id, affected, "committed reservations");
        }
        Ok(affected)
    }

    /// Active -> released for the order, used when a payment fails or is
    /// cancelled before commit. Idempotent for the same reason commit is.
    pub async fn release(&self, order_id: Uuid) -> Result<usize> {
        let affected = self
            .store
            .transition_order_reservations(
                order_id,
                ReservationStatus::Active,
                ReservationStatus::Released,
            )
            .await?;
        if affected > 0 {
            info!(%order_id, affected, "released reservations");
        }
        Ok(affected)
    }

    /// Expires every active reservation past its TTL; returns the count.
    /// Safe to run concurrently with itself and with checkout: it only
    /// touches rows already past expiry.
    pub async fn expire_stale(&self) -> Result<usize> {
        let affected = self.store.expire_reservations_due(Utc::now()).await?;
        if affected > 0 {
            info!(affected, "expired stale reservations");
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryLedger;

    fn line(variant_id: Uuid, quantity: i32) -> ReservationLine {
        ReservationLine {
            variant_id,
            quantity,
        }
    }

    fn seeded(variant: Uuid, on_hand: i64) -> Arc<MemoryLedger> {
        let store = Arc::new(MemoryLedger::new());
        store.set_stock(variant, 1, None, on_hand);
        store
    }

    #[tokio::test]
    async fn reserve_creates_one_row_per_unit() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 5);
        let manager = ReservationManager::new(store.clone());
        let order_id = Uuid::new_v4();

        let ids = manager
            .reserve(Some(order_id), &[line(variant, 3)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let rows = store.reservations_for_order(order_id);
        assert_eq!(rows.len(), 3);
        assert!(rows
            .iter()
            .all(|r| r.quantity == 1 && r.status == ReservationStatus::Active));
        assert!(rows.iter().all(|r| r.expires_at > Utc::now()));
    }

    #[tokio::test]
    async fn reserve_reports_the_shortfall() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 2);
        let manager = ReservationManager::new(store.clone());

        let err = manager.reserve(None, &[line(variant, 3)]).await.unwrap_err();
        match err {
            Error::InsufficientStock {
                variant_id,
                requested,
                available,
            } => {
                assert_eq!(variant_id, variant);
                assert_eq!(requested, 3);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.reservations_for_variant(variant).is_empty());
    }

    #[tokio::test]
    async fn multi_line_reserve_is_all_or_nothing() {
        let plenty = Uuid::new_v4();
        let scarce = Uuid::new_v4();
        let store = Arc::new(MemoryLedger::new());
        store.set_stock(plenty, 1, None, 10);
        store.set_stock(scarce, 1, None, 1);
        let manager = ReservationManager::new(store.clone());

        let err = manager
            .reserve(None, &[line(plenty, 2), line(scarce, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientStock { .. }));
        // The first line must not survive the second line's failure.
        assert!(store.reservations_for_variant(plenty).is_empty());
    }

    #[tokio::test]
    async fn duplicate_variant_lines_are_checked_as_combined_demand() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 4);
        let manager = ReservationManager::new(store.clone());

        // 3 + 3 of the same variant against 4 on hand must fail as a whole.
        let err = manager
            .reserve(None, &[line(variant, 3), line(variant, 3)])
            .await
            .unwrap_err();
        match err {
            Error::InsufficientStock {
                variant_id,
                requested,
                available,
            } => {
                assert_eq!(variant_id, variant);
                assert_eq!(requested, 6);
                assert_eq!(available, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.reservations_for_variant(variant).is_empty());

        // A combined demand that fits still reserves every unit.
        let ids = manager
            .reserve(None, &[line(variant, 2), line(variant, 2)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_reserves_cannot_oversell_the_last_unit() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 1);
        let a = ReservationManager::new(store.clone());
        let b = ReservationManager::new(store.clone());

        let lines_a = [line(variant, 1)];
        let lines_b = [line(variant, 1)];
        let (ra, rb) = tokio::join!(a.reserve(None, &lines_a), b.reserve(None, &lines_b));
        let successes = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one buyer may win the last unit");
        let loser = if ra.is_err() { ra } else { rb };
        assert!(matches!(
            loser.unwrap_err(),
            Error::InsufficientStock { requested: 1, .. }
        ));
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 5);
        let manager = ReservationManager::new(store.clone());
        let order_id = Uuid::new_v4();
        manager
            .reserve(Some(order_id), &[line(variant, 2)])
            .await
            .unwrap();

        assert_eq!(manager.commit(order_id).await.unwrap(), 2);
        assert_eq!(manager.commit(order_id).await.unwrap(), 0);
        assert!(store
            .reservations_for_order(order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Committed));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_availability() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 5);
        let manager = ReservationManager::new(store.clone());
        let order_id = Uuid::new_v4();
        manager
            .reserve(Some(order_id), &[line(variant, 2)])
            .await
            .unwrap();

        assert_eq!(manager.release(order_id).await.unwrap(), 2);
        assert_eq!(manager.release(order_id).await.unwrap(), 0);
        assert_eq!(
            availability::available(store.as_ref(), variant).await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn committed_reservations_never_revert() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 5);
        let manager = ReservationManager::new(store.clone());
        let order_id = Uuid::new_v4();
        manager
            .reserve(Some(order_id), &[line(variant, 1)])
            .await
            .unwrap();
        manager.commit(order_id).await.unwrap();

        // Terminal states ignore further transitions.
        assert_eq!(manager.release(order_id).await.unwrap(), 0);
        store.force_expiry(order_id, Utc::now() - Duration::hours(1));
        assert_eq!(manager.expire_stale().await.unwrap(), 0);
        assert!(store
            .reservations_for_order(order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Committed));
    }

    #[tokio::test]
    async fn expiry_affects_each_reservation_exactly_once() {
        let variant = Uuid::new_v4();
        let store = seeded(variant, 5);
        let manager = ReservationManager::new(store.clone());
        let order_id = Uuid::new_v4();
        manager
            .reserve(Some(order_id), &[line(variant, 1)])
            .await
            .unwrap();
        assert_eq!(
            availability::available(store.as_ref(), variant).await.unwrap(),
            4
        );

        store.force_expiry(order_id, Utc::now() - Duration::minutes(1));
        assert_eq!(manager.expire_stale().await.unwrap(), 1);
        assert_eq!(manager.expire_stale().await.unwrap(), 0);
        assert_eq!(
            availability::available(store.as_ref(), variant).await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn rejects_empty_and_non_positive_lines() {
        let store = Arc::new(MemoryLedger::new());
        let manager = ReservationManager::new(store);

        assert!(matches!(
            manager.reserve(None, &[]).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            manager
                .reserve(None, &[line(Uuid::new_v4(), 0)])
                .await
                .unwrap_err(),
            Error::Validation(_)
        ));
    }
}
