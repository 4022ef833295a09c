//! In-memory [`LedgerStore`] backed by a single mutex.
//!
//! Used by the engine's tests and for local runs without Postgres. The mutex
//! gives every trait operation the same atomicity the production store gets
//! from row-level transactions, including the all-or-nothing reservation
//! insert.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    NewOrder, NewOrderItem, NewWebhookEvent, Order, OrderItem, OrderStatus, Reservation,
    ReservationLine, ReservationStatus, StockLevel, Variant,
};
use uuid::Uuid;

use crate::store::{LedgerStore, ReserveOutcome, StoreError};

#[derive(Default)]
struct State {
    stock: Vec<StockLevel>,
    reservations: Vec<Reservation>,
    orders: HashMap<Uuid, Order>,
    order_items: Vec<OrderItem>,
    variants: HashMap<Uuid, Variant>,
    webhook_keys: HashSet<(String, String, String)>,
    next_order_number: i64,
}

pub struct MemoryLedger {
    state: Mutex<State>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_order_number: 1000,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned mutex means a panicking test; propagating the panic is fine.
        self.state.lock().unwrap()
    }

    pub fn seed_variant(&self, variant: Variant) {
        self.lock().variants.insert(variant.id, variant);
    }

    pub fn set_stock(
        &self,
        variant_id: Uuid,
        location_id: i64,
        inventory_item_id: Option<i64>,
        on_hand: i64,
    ) {
        let mut state = self.lock();
        state
            .stock
            .retain(|l| !(l.variant_id == variant_id && l.location_id == location_id));
        state.stock.push(StockLevel {
            variant_id,
            location_id,
            inventory_item_id,
            on_hand,
            updated_at: Utc::now(),
        });
    }

    pub fn reservations_for_order(&self, order_id: Uuid) -> Vec<Reservation> {
        self.lock()
            .reservations
            .iter()
            .filter(|r| r.order_id == Some(order_id))
            .cloned()
            .collect()
    }

    pub fn reservations_for_variant(&self, variant_id: Uuid) -> Vec<Reservation> {
        self.lock()
            .reservations
            .iter()
            .filter(|r| r.variant_id == variant_id)
            .cloned()
            .collect()
    }

    /// Rewinds expires_at for every reservation of the order, to simulate an
    /// elapsed TTL in tests.
    pub fn force_expiry(&self, order_id: Uuid, at: DateTime<Utc>) {
        let mut state = self.lock();
        for r in &mut state.reservations {
            if r.order_id == Some(order_id) {
                r.expires_at = at;
            }
        }
    }

    /// Active units, plus committed units whose order has not yet folded
    /// them into on_hand. A committed row with no resolvable order stays
    /// counted rather than freeing units nothing paid for.
    fn holds_unit(state: &State, r: &Reservation) -> bool {
        match r.status {
            ReservationStatus::Active => true,
            ReservationStatus::Committed => r
                .order_id
                .and_then(|id| state.orders.get(&id))
                .map_or(true, |o| o.stock_decremented_at.is_none()),
            _ => false,
        }
    }

    fn reserved_locked(state: &State, variant_id: Uuid) -> i64 {
        state
            .reservations
            .iter()
            .filter(|r| r.variant_id == variant_id && Self::holds_unit(state, r))
            .map(|r| i64::from(r.quantity))
            .sum()
    }

    fn available_locked(state: &State, variant_id: Uuid) -> i64 {
        let on_hand: i64 = state
            .stock
            .iter()
            .filter(|l| l.variant_id == variant_id)
            .map(|l| l.on_hand)
            .sum();
        (on_hand - Self::reserved_locked(state, variant_id)).max(0)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn on_hand_total(&self, variant_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .stock
            .iter()
            .filter(|l| l.variant_id == variant_id)
            .map(|l| l.on_hand)
            .sum())
    }

    async fn stock_levels_for_variants(
        &self,
        variant_ids: &[Uuid],
        location_id: i64,
    ) -> Result<Vec<StockLevel>, StoreError> {
        Ok(self
            .lock()
            .stock
            .iter()
            .filter(|l| l.location_id == location_id && variant_ids.contains(&l.variant_id))
            .cloned()
            .collect())
    }

    async fn all_stock_levels(&self) -> Result<Vec<StockLevel>, StoreError> {
        Ok(self.lock().stock.clone())
    }

    async fn upsert_stock_level(
        &self,
        variant_id: Uuid,
        location_id: i64,
        inventory_item_id: Option<i64>,
        on_hand: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(level) = state
            .stock
            .iter_mut()
            .find(|l| l.variant_id == variant_id && l.location_id == location_id)
        {
            level.on_hand = on_hand;
            if inventory_item_id.is_some() {
                level.inventory_item_id = inventory_item_id;
            }
            level.updated_at = Utc::now();
        } else {
            state.stock.push(StockLevel {
                variant_id,
                location_id,
                inventory_item_id,
                on_hand,
                updated_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn reserved_total(&self, variant_id: Uuid) -> Result<i64, StoreError> {
        let state = self.lock();
        Ok(Self::reserved_locked(&state, variant_id))
    }

    async fn reserved_totals(&self) -> Result<Vec<(Uuid, i64)>, StoreError> {
        let state = self.lock();
        let mut totals: HashMap<Uuid, i64> = HashMap::new();
        for r in &state.reservations {
            if Self::holds_unit(&state, r) {
                *totals.entry(r.variant_id).or_default() += i64::from(r.quantity);
            }
        }
        Ok(totals.into_iter().collect())
    }

    async fn reserve_rows(
        &self,
        lines: &[ReservationLine],
        order_id: Option<Uuid>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut state = self.lock();

        // Sum requests per variant first so duplicate-variant lines are
        // checked against their combined demand, then check every variant
        // before writing anything.
        let mut requested: Vec<(Uuid, i64)> = Vec::new();
        for line in lines {
            match requested.iter_mut().find(|(id, _)| *id == line.variant_id) {
                Some((_, total)) => *total += i64::from(line.quantity),
                None => requested.push((line.variant_id, i64::from(line.quantity))),
            }
        }
        for (variant_id, total) in &requested {
            let available = Self::available_locked(&state, *variant_id);
            if available < *total {
                return Ok(ReserveOutcome::Insufficient {
                    variant_id: *variant_id,
                    requested: *total,
                    available,
                });
            }
        }

        let now = Utc::now();
        let mut ids = Vec::new();
        for line in lines {
            for _ in 0..line.quantity {
                let id = Uuid::new_v4();
                state.reservations.push(Reservation {
                    id,
                    variant_id: line.variant_id,
                    order_id,
                    quantity: 1,
                    status: ReservationStatus::Active,
                    expires_at,
                    created_at: now,
                    updated_at: now,
                });
                ids.push(id);
            }
        }
        Ok(ReserveOutcome::Reserved(ids))
    }

    async fn transition_order_reservations(
        &self,
        order_id: Uuid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut affected = 0;
        for r in &mut state.reservations {
            if r.order_id == Some(order_id) && r.status == from {
                r.status = to;
                r.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn expire_reservations_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let mut affected = 0;
        for r in &mut state.reservations {
            if r.status == ReservationStatus::Active && r.expires_at < now {
                r.status = ReservationStatus::Expired;
                r.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_order(&self, order: &NewOrder) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.orders.contains_key(&order.id)
            || state
                .orders
                .values()
                .any(|o| o.order_number == order.order_number)
        {
            return Err(StoreError::UniqueViolation);
        }
        let now = Utc::now();
        state.orders.insert(
            order.id,
            Order {
                id: order.id,
                order_number: order.order_number.clone(),
                status: order.status,
                payment_method: order.payment_method,
                total: order.total.clone(),
                currency: order.currency.clone(),
                customer_name: order.customer_name.clone(),
                customer_email: order.customer_email.clone(),
                customer_phone: order.customer_phone.clone(),
                shipping_address: order.shipping_address.clone(),
                payment_ref: None,
                reservations_committed_at: None,
                stock_decremented_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.lock().orders.get(&id).cloned())
    }

    async fn orders_with_status(
        &self,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let state = self.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        payment_ref: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(order) = state.orders.get_mut(&id) {
            order.status = status;
            if payment_ref.is_some() {
                order.payment_ref = payment_ref;
            }
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_reservations_committed_at(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(order) = state.orders.get_mut(&id) {
            if order.reservations_committed_at.is_none() {
                order.reservations_committed_at = Some(at);
                order.updated_at = at;
            }
        }
        Ok(())
    }

    async fn claim_stock_decrement(
        &self,
        id: Uuid,
        location_id: i64,
        lines: &[ReservationLine],
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.orders.get_mut(&id) {
            Some(order) if order.stock_decremented_at.is_none() => {
                order.stock_decremented_at = Some(at);
                order.updated_at = at;
            }
            _ => return Ok(false),
        }
        for line in lines {
            if let Some(level) = state
                .stock
                .iter_mut()
                .find(|l| l.variant_id == line.variant_id && l.location_id == location_id)
            {
                level.on_hand -= i64::from(line.quantity);
                level.updated_at = at;
            }
        }
        Ok(true)
    }

    async fn next_order_number(&self) -> Result<i64, StoreError> {
        let mut state = self.lock();
        let n = state.next_order_number;
        state.next_order_number += 1;
        Ok(n)
    }

    async fn stuck_pending_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::PendingPayment && o.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn insert_order_items(&self, items: &[NewOrderItem]) -> Result<(), StoreError> {
        let mut state = self.lock();
        for item in items {
            state.order_items.push(OrderItem {
                id: item.id,
                order_id: item.order_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
                title: item.title.clone(),
                sku: item.sku.clone(),
            });
        }
        Ok(())
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError> {
        Ok(self
            .lock()
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn upsert_variant(&self, variant: &Variant) -> Result<(), StoreError> {
        self.lock().variants.insert(variant.id, variant.clone());
        Ok(())
    }

    async fn variants_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Variant>, StoreError> {
        let state = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.variants.get(id).cloned())
            .collect())
    }

    async fn variant_by_inventory_item(
        &self,
        inventory_item_id: i64,
    ) -> Result<Option<Variant>, StoreError> {
        Ok(self
            .lock()
            .variants
            .values()
            .find(|v| v.inventory_item_id == Some(inventory_item_id))
            .cloned())
    }

    async fn insert_webhook_event(&self, event: &NewWebhookEvent) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = (
            event.source.as_str().to_string(),
            event.topic.clone(),
            event.external_id.clone(),
        );
        if !state.webhook_keys.insert(key) {
            return Err(StoreError::UniqueViolation);
        }
        Ok(())
    }
}
