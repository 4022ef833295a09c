//! Drift detection. Reports anomalies for manual follow-up; deliberately
//! fixes nothing, since auto-correcting would mask the bug that caused the
//! drift.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::store::LedgerStore;
use crate::Result;

/// Orders pending payment longer than this are flagged for an operator.
pub const STUCK_PENDING_HOURS: i64 = 24;

/// A variant whose held reservations exceed its on-hand stock. Either the
/// reserve/commit/expire logic misbehaved or an external sync went bad.
#[derive(Debug, Clone, Serialize)]
pub struct NegativeAvailability {
    pub variant_id: Uuid,
    pub on_hand: i64,
    pub reserved: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckOrder {
    pub id: Uuid,
    pub order_number: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub negative_availability: Vec<NegativeAvailability>,
    pub stuck_pending_payment: Vec<StuckOrder>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.negative_availability.is_empty() && self.stuck_pending_payment.is_empty()
    }
}

/// Sweeps the ledger for drift: per-variant on_hand minus held reservations
/// going negative, and orders stuck in pending_payment past the threshold.
/// Read-only.
pub async fn run(store: &dyn LedgerStore, now: DateTime<Utc>) -> Result<ReconciliationReport> {
    let mut on_hand_by_variant: HashMap<Uuid, i64> = HashMap::new();
    for level in store.all_stock_levels().await? {
        *on_hand_by_variant.entry(level.variant_id).or_default() += level.on_hand;
    }

    let mut negative = Vec::new();
    for (variant_id, reserved) in store.reserved_totals().await? {
        let on_hand = on_hand_by_variant.get(&variant_id).copied().unwrap_or(0);
        if on_hand - reserved < 0 {
            negative.push(NegativeAvailability {
                variant_id,
                on_hand,
                reserved,
            });
        }
    }
    negative.sort_by_key(|n| n.variant_id);

    let cutoff = now - Duration::hours(STUCK_PENDING_HOURS);
    let stuck: Vec<StuckOrder> = store
        .stuck_pending_orders(cutoff)
        .await?
        .into_iter()
        .map(|o| StuckOrder {
            id: o.id,
            order_number: o.order_number,
            created_at: o.created_at,
        })
        .collect();

    if !negative.is_empty() || !stuck.is_empty() {
        warn!(
            negative = negative.len(),
            stuck = stuck.len(),
            "reconciliation found drift"
        );
    }
    Ok(ReconciliationReport {
        negative_availability: negative,
        stuck_pending_payment: stuck,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryLedger;
    use crate::store::ReserveOutcome;
    use shared::ReservationLine;

    #[tokio::test]
    async fn clean_ledger_yields_an_empty_report() {
        let store = MemoryLedger::new();
        store.set_stock(Uuid::new_v4(), 1, None, 5);

        let report = run(&store, Utc::now()).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn flags_variants_reserved_beyond_on_hand() {
        let store = MemoryLedger::new();
        let variant = Uuid::new_v4();
        store.set_stock(variant, 1, None, 2);
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
        assert!(matches!(outcome, ReserveOutcome::Reserved(_)));
        // A bad sync shrinks on_hand after the units were already claimed.
        store.set_stock(variant, 1, None, 1);

        let report = run(&store, Utc::now()).await.unwrap();
        assert_eq!(report.negative_availability.len(), 1);
        let anomaly = &report.negative_availability[0];
        assert_eq!(anomaly.variant_id, variant);
        assert_eq!(anomaly.on_hand, 1);
        assert_eq!(anomaly.reserved, 2);
    }

    #[tokio::test]
    async fn flags_orders_stuck_pending_past_the_threshold() {
        use bigdecimal::BigDecimal;
        use shared::{NewOrder, OrderStatus, PaymentMethod};

        let store = MemoryLedger::new();
        let order_id = uuid::Uuid::new_v4();
        store
            .insert_order(&NewOrder {
                id: order_id,
                order_number: "ORD-1000".into(),
                status: OrderStatus::PendingPayment,
                payment_method: PaymentMethod::Card,
                total: BigDecimal::from(100),
                currency: "EGP".into(),
                customer_name: "A".into(),
                customer_email: "a@example.com".into(),
                customer_phone: "1".into(),
                shipping_address: None,
            })
            .await
            .unwrap();

        // Not stuck yet from "now", but stuck when viewed two days ahead.
        let report = run(&store, Utc::now()).await.unwrap();
        assert!(report.stuck_pending_payment.is_empty());

        let later = Utc::now() + Duration::hours(48);
        let report = run(&store, later).await.unwrap();
        assert_eq!(report.stuck_pending_payment.len(), 1);
        assert_eq!(report.stuck_pending_payment[0].id, order_id);
        assert_eq!(report.stuck_pending_payment[0].order_number, "ORD-1000");
    }
}
