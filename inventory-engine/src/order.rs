//! Order status transitions and their inventory side effects.
//!
//! This module exclusively owns order.status. Payment-driven transitions only
//! fire from `pending_payment`; administrative edits may move an order
//! anywhere (policy belongs to the caller), but any transition into a
//! fulfilling status runs the commit + decrement pipeline. Stock is
//! decremented towards the external source at most once per order.

use std::sync::Arc;

use chrono::Utc;
use shared::{Order, OrderStatus, ReservationLine};
use tracing::{info, warn};
use uuid::Uuid;

use crate::reservation::ReservationManager;
use crate::store::LedgerStore;
use crate::sync::StockSync;
use crate::{Error, Result};

/// What a verified payment notification ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Paid,
    Cancelled,
    /// The order had already left `pending_payment`; nothing was changed.
    AlreadyProcessed,
}

pub struct OrderLifecycle {
    store: Arc<dyn LedgerStore>,
    stock: Arc<dyn StockSync>,
    reservations: ReservationManager,
    location_id: i64,
}

impl OrderLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>, stock: Arc<dyn StockSync>, location_id: i64) -> Self {
        let reservations = ReservationManager::new(store.clone());
        Self {
            store,
            stock,
            reservations,
            location_id,
        }
    }

    async fn require_order(&self, order_id: Uuid) -> Result<Order> {
        self.store
            .order(order_id)
            .await?
            .ok_or(Error::OrderNotFound(order_id))
    }

    /// Verified successful payment: pending_payment -> paid, commit the
    /// reservations, then decrement external stock once.
    pub async fn record_payment_success(
        &self,
        order_id: Uuid,
        payment_ref: Option<String>,
    ) -> Result<PaymentOutcome> {
        let order = self.require_order(order_id).await?;
        if order.status != OrderStatus::PendingPayment {
            return Ok(PaymentOutcome::AlreadyProcessed);
        }

        self.reservations.commit(order_id).await?;
        self.store
            .update_order_status(order_id, OrderStatus::Paid, payment_ref)
            .await?;
        self.store
            .set_reservations_committed_at(order_id, Utc::now())
            .await?;
        info!(%order_id, "order paid");

        self.decrement_stock_once(order_id).await?;
        Ok(PaymentOutcome::Paid)
    }

    /// Verified failed payment: pending_payment -> cancelled, release the
    /// reservations so the units go back on sale immediately.
    pub async fn record_payment_failure(&self, order_id: Uuid) -> Result<PaymentOutcome> {
        let order = self.require_order(order_id).await?;
        if order.status != OrderStatus::PendingPayment {
            return Ok(PaymentOutcome::AlreadyProcessed);
        }

        self.reservations.release(order_id).await?;
        self.store
            .update_order_status(order_id, OrderStatus::Cancelled, None)
            .await?;
        info!(%order_id, "payment failed, order cancelled");
        Ok(PaymentOutcome::Cancelled)
    }

    /// Administrative status edit. Unconditional, except that entering a
    /// fulfilling status also commits reservations and decrements stock.
    pub async fn set_status(&self, order_id: Uuid, status: OrderStatus) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if order.status == status {
            return Ok(order);
        }

        self.store
            .update_order_status(order_id, status, None)
            .await?;
        info!(%order_id, from = order.status.as_str(), to = status.as_str(), "order status edited");

        if status.is_fulfilling() {
            let committed = self.reservations.commit(order_id).await?;
            if committed > 0 {
                self.store
                    .set_reservations_committed_at(order_id, Utc::now())
                    .await?;
            }
            self.decrement_stock_once(order_id).await?;
        }
        self.require_order(order_id).await
    }

    /// Pushes the order's sold quantities to the external stock source, at
    /// most once per order, then folds them into local on_hand in the same
    /// store step that stamps stock_decremented_at.
    ///
    /// stock_decremented_at is only stamped after every line adjusted, so a
    /// failed call leaves the order flagged for reconciliation instead of
    /// silently dropping units. Adjust failures never unwind the order
    /// status and are never retried inline.
    pub async fn decrement_stock_once(&self, order_id: Uuid) -> Result<bool> {
        let order = self.require_order(order_id).await?;
        if order.stock_decremented_at.is_some() {
            return Ok(false);
        }

        let items = self.store.order_items(order_id).await?;
        let variant_ids: Vec<Uuid> = items.iter().map(|i| i.variant_id).collect();
        let levels = self
            .store
            .stock_levels_for_variants(&variant_ids, self.location_id)
            .await?;

        let mut all_adjusted = true;
        for item in &items {
            let inventory_item_id = levels
                .iter()
                .find(|l| l.variant_id == item.variant_id)
                .and_then(|l| l.inventory_item_id);
            match inventory_item_id {
                Some(inventory_item_id) => {
                    if let Err(e) = self
                        .stock
                        .adjust(
                            inventory_item_id,
                            self.location_id,
                            -i64::from(item.quantity),
                        )
                        .await
                    {
                        warn!(
                            %order_id,
                            variant_id = %item.variant_id,
                            error = %e,
                            "external stock decrement failed, leaving order for reconciliation"
                        );
                        all_adjusted = false;
                    }
                }
                // Nothing to adjust for unmapped variants; do not hold the
                // stamp hostage to a mapping that may never exist.
                None => {
                    warn!(
                        %order_id,
                        variant_id = %item.variant_id,
                        "no inventory item mapping, skipping external decrement"
                    );
                }
            }
        }

        if !all_adjusted {
            return Ok(false);
        }
        let sold: Vec<ReservationLine> = items
            .iter()
            .map(|i| ReservationLine {
                variant_id: i.variant_id,
                quantity: i.quantity,
            })
            .collect();
        let claimed = self
            .store
            .claim_stock_decrement(order_id, self.location_id, &sold, Utc::now())
            .await?;
        if claimed {
            info!(%order_id, "external stock decremented");
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryLedger;
    use crate::testing::RecordingStockSync;
    use bigdecimal::BigDecimal;
    use shared::{NewOrder, NewOrderItem, PaymentMethod, ReservationLine, ReservationStatus, Variant};
    use std::str::FromStr;

    struct Fixture {
        store: Arc<MemoryLedger>,
        stock: Arc<RecordingStockSync>,
        lifecycle: OrderLifecycle,
        variant_id: Uuid,
        order_id: Uuid,
    }

    /// Seeds a variant with on_hand 5, a pending-payment card order for two
    /// units, its item snapshot, and two active reservations.
    async fn pending_card_order() -> Fixture {
        let store = Arc::new(MemoryLedger::new());
        let stock = Arc::new(RecordingStockSync::new());
        let variant_id = Uuid::new_v4();
        store.seed_variant(Variant {
            id: variant_id,
            title: Some("Tee".into()),
            sku: Some("TEE-1".into()),
            price: BigDecimal::from_str("150.00").unwrap(),
            inventory_item_id: Some(42),
        });
        store.set_stock(variant_id, 7, Some(42), 5);

        let order_id = Uuid::new_v4();
        store
            .insert_order(&NewOrder {
                id: order_id,
                order_number: "ORD-1000".into(),
                status: OrderStatus::PendingPayment,
                payment_method: PaymentMethod::Card,
                total: BigDecimal::from_str("300.00").unwrap(),
                currency: "EGP".into(),
                customer_name: "A Customer".into(),
                customer_email: "a@example.com".into(),
                customer_phone: "+201000000000".into(),
                shipping_address: None,
            })
            .await
            .unwrap();
        store
            .insert_order_items(&[NewOrderItem {
                id: Uuid::new_v4(),
                order_id,
                variant_id,
                quantity: 2,
                unit_price: BigDecimal::from_str("150.00").unwrap(),
                title: Some("Tee".into()),
                sku: Some("TEE-1".into()),
            }])
            .await
            .unwrap();

        let manager = ReservationManager::new(store.clone());
        manager
            .reserve(
                Some(order_id),
                &[ReservationLine {
                    variant_id,
                    quantity: 2,
                }],
            )
            .await
            .unwrap();

        let lifecycle = OrderLifecycle::new(store.clone(), stock.clone(), 7);
        Fixture {
            store,
            stock,
            lifecycle,
            variant_id,
            order_id,
        }
    }

    #[tokio::test]
    async fn payment_success_pays_commits_and_decrements_once() {
        let fx = pending_card_order().await;

        let outcome = fx
            .lifecycle
            .record_payment_success(fx.order_id, Some("txn-1".into()))
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::Paid);

        let order = fx.store.order(fx.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment_ref.as_deref(), Some("txn-1"));
        assert!(order.reservations_committed_at.is_some());
        assert!(order.stock_decremented_at.is_some());
        assert!(fx
            .store
            .reservations_for_order(fx.order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Committed));
        assert_eq!(fx.stock.adjustments(), vec![(42, 7, -2)]);
        // The claim also folds the sale into local on_hand.
        assert_eq!(fx.store.on_hand_total(fx.variant_id).await.unwrap(), 3);
        assert_eq!(
            crate::availability::available(fx.store.as_ref(), fx.variant_id)
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn duplicate_payment_success_adjusts_stock_exactly_once() {
        let fx = pending_card_order().await;

        let first = fx
            .lifecycle
            .record_payment_success(fx.order_id, None)
            .await
            .unwrap();
        let second = fx
            .lifecycle
            .record_payment_success(fx.order_id, None)
            .await
            .unwrap();
        assert_eq!(first, PaymentOutcome::Paid);
        assert_eq!(second, PaymentOutcome::AlreadyProcessed);
        assert_eq!(fx.stock.adjustments().len(), 1);
    }

    #[tokio::test]
    async fn payment_failure_cancels_and_releases() {
        let fx = pending_card_order().await;

        let outcome = fx
            .lifecycle
            .record_payment_failure(fx.order_id)
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::Cancelled);

        let order = fx.store.order(fx.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.stock_decremented_at.is_none());
        assert!(fx
            .store
            .reservations_for_order(fx.order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Released));
        assert!(fx.stock.adjustments().is_empty());
        assert_eq!(
            crate::availability::available(fx.store.as_ref(), fx.variant_id)
                .await
                .unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn failed_decrement_keeps_order_paid_and_unstamped() {
        let fx = pending_card_order().await;
        fx.stock.set_failing(true);

        let outcome = fx
            .lifecycle
            .record_payment_success(fx.order_id, None)
            .await
            .unwrap();
        assert_eq!(outcome, PaymentOutcome::Paid);

        let order = fx.store.order(fx.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid, "sync failure must not roll back");
        assert!(order.stock_decremented_at.is_none(), "left for reconciliation");
    }

    #[tokio::test]
    async fn admin_edit_into_paid_runs_the_fulfilment_pipeline() {
        let fx = pending_card_order().await;

        let order = fx
            .lifecycle
            .set_status(fx.order_id, OrderStatus::Paid)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(order.stock_decremented_at.is_some());
        assert_eq!(fx.stock.adjustments(), vec![(42, 7, -2)]);

        // Flapping the status back and forth must not decrement again.
        fx.lifecycle
            .set_status(fx.order_id, OrderStatus::PendingPayment)
            .await
            .unwrap();
        let order = fx
            .lifecycle
            .set_status(fx.order_id, OrderStatus::Paid)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(fx.stock.adjustments().len(), 1);
    }

    #[tokio::test]
    async fn admin_edit_between_non_fulfilling_statuses_touches_no_stock() {
        let fx = pending_card_order().await;

        let order = fx
            .lifecycle
            .set_status(fx.order_id, OrderStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(fx.stock.adjustments().is_empty());
        // Admin cancellation does not release reservations by itself; the
        // TTL sweep reclaims them.
        assert!(fx
            .store
            .reservations_for_order(fx.order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Active));
    }

    #[tokio::test]
    async fn unknown_order_is_an_error() {
        let store = Arc::new(MemoryLedger::new());
        let lifecycle =
            OrderLifecycle::new(store, Arc::new(RecordingStockSync::new()), 1);
        let missing = Uuid::new_v4();
        assert!(matches!(
            lifecycle.record_payment_success(missing, None).await.unwrap_err(),
            Error::OrderNotFound(id) if id == missing
        ));
    }
}
