//! Ledger store interface.
//!
//! The store is the single shared mutable resource in the system. Every
//! component coordinates exclusively through the row-level primitives below:
//! conditional updates, unique-constraint inserts, and one composite
//! reservation insert that re-checks availability inside the store's own
//! transaction so a multi-line reserve is all-or-nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    NewOrder, NewOrderItem, NewWebhookEvent, Order, OrderItem, OrderStatus, ReservationLine,
    ReservationStatus, StockLevel, Variant,
};
use uuid::Uuid;

/// Transport-level store failures. `UniqueViolation` is split out because the
/// webhook dedup gate treats it as a signal rather than an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violation")]
    UniqueViolation,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result of an atomic multi-line reservation attempt. `Insufficient` names
/// the first line that could not be covered; no rows were written.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved(Vec<Uuid>),
    Insufficient {
        variant_id: Uuid,
        requested: i64,
        available: i64,
    },
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // --- stock levels ---

    /// Sum of on_hand across all locations for the variant.
    async fn on_hand_total(&self, variant_id: Uuid) -> Result<i64, StoreError>;

    async fn stock_levels_for_variants(
        &self,
        variant_ids: &[Uuid],
        location_id: i64,
    ) -> Result<Vec<StockLevel>, StoreError>;

    async fn all_stock_levels(&self) -> Result<Vec<StockLevel>, StoreError>;

    /// Overwrites on_hand for (variant, location), creating the row if absent.
    /// Only sync jobs and inbound stock-update notifications call this.
    async fn upsert_stock_level(
        &self,
        variant_id: Uuid,
        location_id: i64,
        inventory_item_id: Option<i64>,
        on_hand: i64,
    ) -> Result<(), StoreError>;

    // --- reservations ---

    /// Units currently held against the variant: active reservations plus
    /// committed ones whose order has not yet decremented local stock.
    /// Committed units stop counting only once [`claim_stock_decrement`]
    /// has folded them into on_hand, so a sold unit is never momentarily
    /// sellable again.
    ///
    /// [`claim_stock_decrement`]: LedgerStore::claim_stock_decrement
    async fn reserved_total(&self, variant_id: Uuid) -> Result<i64, StoreError>;

    /// Per-variant held-unit sums (same semantics as [`reserved_total`]),
    /// for reconciliation.
    ///
    /// [`reserved_total`]: LedgerStore::reserved_total
    async fn reserved_totals(&self) -> Result<Vec<(Uuid, i64)>, StoreError>;

    /// Inserts one active reservation row per requested unit, for all lines,
    /// inside one transaction. Requested quantities are summed per variant
    /// first, so duplicate-variant lines cannot slip past the availability
    /// re-check; if any variant falls short nothing is written.
    async fn reserve_rows(
        &self,
        lines: &[ReservationLine],
        order_id: Option<Uuid>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Moves every reservation of `order_id` currently in `from` to `to`,
    /// returning the number of rows affected. Rows already in a terminal
    /// state are untouched, which is what makes commit/release idempotent.
    async fn transition_order_reservations(
        &self,
        order_id: Uuid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<usize, StoreError>;

    /// Expires every active reservation with `expires_at < now`.
    async fn expire_reservations_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    // --- orders ---

    async fn insert_order(&self, order: &NewOrder) -> Result<(), StoreError>;

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn orders_with_status(
        &self,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, StoreError>;

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        payment_ref: Option<String>,
    ) -> Result<(), StoreError>;

    async fn set_reservations_committed_at(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Sets stock_decremented_at only when it is still NULL and, in the same
    /// atomic step, subtracts the sold quantities from local on_hand at the
    /// location, so the order's committed units hand over to on_hand without
    /// a window where they count as sellable. Lines without a local stock
    /// row are skipped. Returns whether this call claimed the stamp; a
    /// `false` means another caller already did and nothing was subtracted.
    async fn claim_stock_decrement(
        &self,
        id: Uuid,
        location_id: i64,
        lines: &[ReservationLine],
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Next value of the monotonic order-number sequence.
    async fn next_order_number(&self) -> Result<i64, StoreError>;

    /// Orders still pending_payment created before `cutoff`.
    async fn stuck_pending_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    // --- order items ---

    async fn insert_order_items(&self, items: &[NewOrderItem]) -> Result<(), StoreError>;

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError>;

    // --- variants ---

    /// Inserts or overwrites the catalog snapshot row for the variant.
    /// Only bulk sync calls this.
    async fn upsert_variant(&self, variant: &Variant) -> Result<(), StoreError>;

    async fn variants_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Variant>, StoreError>;

    async fn variant_by_inventory_item(
        &self,
        inventory_item_id: i64,
    ) -> Result<Option<Variant>, StoreError>;

    // --- webhook dedup log ---

    /// Append-only insert keyed by (source, topic, external_id). Must fail
    /// with [`StoreError::UniqueViolation`] when the key already exists.
    async fn insert_webhook_event(&self, event: &NewWebhookEvent) -> Result<(), StoreError>;
}
