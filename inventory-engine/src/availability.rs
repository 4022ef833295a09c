//! Sellable-quantity derivation.

use uuid::Uuid;

use crate::store::LedgerStore;
use crate::Result;

/// Units currently sellable for a variant: on_hand summed across locations
/// minus the units held by reservations, clamped at zero. Held units are the
/// active ones plus committed ones whose order has not yet folded its sale
/// into on_hand, so a sold unit never reappears as sellable between commit
/// and the stock decrement.
///
/// The two sums are read at slightly different instants rather than under one
/// snapshot; any over-count that slips through is bounded by the reservation
/// TTL and caught by reconciliation. The reservation path re-checks under the
/// store transaction before writing rows.
pub async fn available(store: &dyn LedgerStore, variant_id: Uuid) -> Result<i64> {
    let on_hand = store.on_hand_total(variant_id).await?;
    let reserved = store.reserved_total(variant_id).await?;
    Ok((on_hand - reserved).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryLedger;
    use crate::store::ReserveOutcome;
    use chrono::{Duration, Utc};
    use shared::ReservationLine;

    #[tokio::test]
    async fn subtracts_active_reservations_from_on_hand() {
        let store = MemoryLedger::new();
        let variant = Uuid::new_v4();
        store.set_stock(variant, 1, None, 5);

        let outcome = store
            .reserve_rows(
                &[ReservationLine {
                    variant_id: variant,
                    quantity: 2,
                }],
                None,
                Utc::now() + Duration::minutes(15),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ReserveOutcome::Reserved(ids) if ids.len() == 2));

        assert_eq!(available(&store, variant).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn committed_units_stay_held_until_stock_is_decremented() {
        use bigdecimal::BigDecimal;
        use shared::{NewOrder, OrderStatus, PaymentMethod, ReservationStatus};

        let store = MemoryLedger::new();
        let variant = Uuid::new_v4();
        store.set_stock(variant, 1, None, 1);
        let order_id = Uuid::new_v4();
        store
            .insert_order(&NewOrder {
                id: order_id,
                order_number: "ORD-1000".into(),
                status: OrderStatus::CodConfirmed,
                payment_method: PaymentMethod::CashOnDelivery,
                total: BigDecimal::from(150),
                currency: "EGP".into(),
                customer_name: "A".into(),
                customer_email: "a@example.com".into(),
                customer_phone: "1".into(),
                shipping_address: None,
            })
            .await
            .unwrap();
        let line = ReservationLine {
            variant_id: variant,
            quantity: 1,
        };
        store
            .reserve_rows(&[line], Some(order_id), Utc::now() + Duration::minutes(15))
            .await
            .unwrap();
        store
            .transition_order_reservations(
                order_id,
                ReservationStatus::Active,
                ReservationStatus::Committed,
            )
            .await
            .unwrap();

        // The sale is committed but on_hand still says 1: the unit must not
        // be sellable to a second buyer in the meantime.
        assert_eq!(available(&store, variant).await.unwrap(), 0);

        store
            .claim_stock_decrement(order_id, 1, &[line], Utc::now())
            .await
            .unwrap();
        assert_eq!(store.on_hand_total(variant).await.unwrap(), 0);
        assert_eq!(available(&store, variant).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sums_on_hand_across_locations() {
        let store = MemoryLedger::new();
        let variant = Uuid::new_v4();
        store.set_stock(variant, 1, None, 2);
        store.set_stock(variant, 2, None, 3);

        assert_eq!(available(&store, variant).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn never_reports_negative_availability() {
        let store = MemoryLedger::new();
        let variant = Uuid::new_v4();
        store.set_stock(variant, 1, None, 1);
        store
            .reserve_rows(
                &[ReservationLine {
                    variant_id: variant,
                    quantity: 1,
                }],
                None,
                Utc::now() + Duration::minutes(15),
            )
            .await
            .unwrap();
        // A bad external sync later shrinks on_hand below what is reserved.
        store.set_stock(variant, 1, None, 0);

        assert_eq!(available(&store, variant).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_variant_is_zero() {
        let store = MemoryLedger::new();
        assert_eq!(available(&store, Uuid::new_v4()).await.unwrap(), 0);
    }
}
