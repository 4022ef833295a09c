//! Postgres-backed ledger. Row-level conditional updates do most of the
//! concurrency work; the two multi-statement transactions are the composite
//! reserve, which locks the affected stock rows while it re-checks
//! availability, and the decrement claim, which stamps the order and folds
//! the sold units into on_hand in one step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use inventory_engine::store::{LedgerStore, ReserveOutcome, StoreError};
use shared::{
    NewOrder, NewOrderItem, NewWebhookEvent, Order, OrderItem, OrderStatus, ReservationLine,
    ReservationStatus, StockLevel, Variant,
};
use uuid::Uuid;

use crate::models::{
    NewOrderRow, NewReservationRow, NewWebhookEventRow, OrderItemRow, OrderRow, StockLevelRow,
    VariantRow,
};
use crate::schema::{order_items, orders, product_variants, reservations, stock_levels};

pub type DbPool = Pool<AsyncPgConnection>;

fn db_err(e: DieselError) -> StoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            StoreError::UniqueViolation
        }
        other => StoreError::Backend(other.to_string()),
    }
}

pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn on_hand_total(&self, variant_id: Uuid) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let levels: Vec<i64> = stock_levels::table
            .filter(stock_levels::variant_id.eq(variant_id))
            .select(stock_levels::on_hand)
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(levels.iter().sum())
    }

    async fn stock_levels_for_variants(
        &self,
        variant_ids: &[Uuid],
        location_id: i64,
    ) -> Result<Vec<StockLevel>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<StockLevelRow> = stock_levels::table
            .filter(stock_levels::variant_id.eq_any(variant_ids))
            .filter(stock_levels::location_id.eq(location_id))
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(StockLevel::from).collect())
    }

    async fn all_stock_levels(&self) -> Result<Vec<StockLevel>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<StockLevelRow> = stock_levels::table
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(StockLevel::from).collect())
    }

    async fn upsert_stock_level(
        &self,
        variant_id: Uuid,
        location_id: i64,
        inventory_item_id: Option<i64>,
        on_hand: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        diesel::insert_into(stock_levels::table)
            .values(&StockLevelRow {
                variant_id,
                location_id,
                inventory_item_id,
                on_hand,
                updated_at: now,
            })
            .on_conflict((stock_levels::variant_id, stock_levels::location_id))
            .do_update()
            .set((
                stock_levels::on_hand.eq(on_hand),
                stock_levels::inventory_item_id.eq(inventory_item_id),
                stock_levels::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn reserved_total(&self, variant_id: Uuid) -> Result<i64, StoreError> {
        // Held units: active rows, plus committed rows whose order has not
        // stamped stock_decremented_at yet. The left join leaves the stamp
        // NULL for committed rows with no resolvable order, so those stay
        // counted too.
        let mut conn = self.conn().await?;
        let total: Option<i64> = reservations::table
            .left_join(orders::table.on(orders::id.nullable().eq(reservations::order_id)))
            .filter(reservations::variant_id.eq(variant_id))
            .filter(
                reservations::status
                    .eq(ReservationStatus::Active.as_str())
                    .or(reservations::status
                        .eq(ReservationStatus::Committed.as_str())
                        .and(orders::stock_decremented_at.is_null())),
            )
            .select(diesel::dsl::sum(reservations::quantity))
            .first(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(total.unwrap_or(0))
    }

    async fn reserved_totals(&self) -> Result<Vec<(Uuid, i64)>, StoreError> {
        let mut conn = self.conn().await?;
        let totals: Vec<(Uuid, Option<i64>)> = reservations::table
            .left_join(orders::table.on(orders::id.nullable().eq(reservations::order_id)))
            .filter(
                reservations::status
                    .eq(ReservationStatus::Active.as_str())
                    .or(reservations::status
                        .eq(ReservationStatus::Committed.as_str())
                        .and(orders::stock_decremented_at.is_null())),
            )
            .group_by(reservations::variant_id)
            .select((
                reservations::variant_id,
                diesel::dsl::sum(reservations::quantity),
            ))
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(totals
            .into_iter()
            .map(|(id, total)| (id, total.unwrap_or(0)))
            .collect())
    }

    async fn reserve_rows(
        &self,
        lines: &[ReservationLine],
        order_id: Option<Uuid>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut conn = self.conn().await?;
        let lines = lines.to_vec();
        conn.transaction::<ReserveOutcome, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                // Sum requests per variant so duplicate-variant lines are
                // checked against their combined demand. BTreeMap iteration
                // also gives every transaction the same variant lock order.
                let mut requested: BTreeMap<Uuid, i64> = BTreeMap::new();
                for line in &lines {
                    *requested.entry(line.variant_id).or_default() += i64::from(line.quantity);
                }

                for (&variant_id, &total) in &requested {
                    // Lock the variant's stock rows so a concurrent reserve
                    // for the same variant waits behind this check.
                    let locked: Vec<i64> = stock_levels::table
                        .filter(stock_levels::variant_id.eq(variant_id))
                        .select(stock_levels::on_hand)
                        .for_update()
                        .load(conn)
                        .await?;
                    let on_hand: i64 = locked.iter().sum();
                    let reserved: Option<i64> = reservations::table
                        .left_join(
                            orders::table.on(orders::id.nullable().eq(reservations::order_id)),
                        )
                        .filter(reservations::variant_id.eq(variant_id))
                        .filter(
                            reservations::status
                                .eq(ReservationStatus::Active.as_str())
                                .or(reservations::status
                                    .eq(ReservationStatus::Committed.as_str())
                                    .and(orders::stock_decremented_at.is_null())),
                        )
                        .select(diesel::dsl::sum(reservations::quantity))
                        .first(conn)
                        .await?;
                    let available = (on_hand - reserved.unwrap_or(0)).max(0);
                    if available < total {
                        return Ok(ReserveOutcome::Insufficient {
                            variant_id,
                            requested: total,
                            available,
                        });
                    }
                }

                let mut rows: Vec<NewReservationRow> = Vec::new();
                for line in &lines {
                    for _ in 0..line.quantity {
                        rows.push(NewReservationRow {
                            id: Uuid::new_v4(),
                            variant_id: line.variant_id,
                            order_id,
                            quantity: 1,
                            status: ReservationStatus::Active.as_str().to_string(),
                            expires_at,
                        });
                    }
                }
                let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
                diesel::insert_into(reservations::table)
                    .values(&rows)
                    .execute(conn)
                    .await?;
                Ok(ReserveOutcome::Reserved(ids))
            })
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn transition_order_reservations(
        &self,
        order_id: Uuid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(
            reservations::table
                .filter(reservations::order_id.eq(Some(order_id)))
                .filter(reservations::status.eq(from.as_str())),
        )
        .set((
            reservations::status.eq(to.as_str()),
            reservations::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(db_err)
    }

    async fn expire_reservations_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(
            reservations::table
                .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
                .filter(reservations::expires_at.lt(now)),
        )
        .set((
            reservations::status.eq(ReservationStatus::Expired.as_str()),
            reservations::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await
        .map_err(db_err)
    }

    async fn insert_order(&self, order: &NewOrder) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(orders::table)
            .values(&NewOrderRow::from(order))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let mut conn = self.conn().await?;
        let row: Option<OrderRow> = orders::table
            .find(id)
            .first(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.map(Order::try_from).transpose()
    }

    async fn orders_with_status(
        &self,
        status: Option<OrderStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let mut conn = self.conn().await?;
        let mut query = orders::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(orders::status.eq(status.as_str()));
        }
        let rows: Vec<OrderRow> = query
            .order(orders::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(Order::try_from).collect()
    }

    async fn update_order_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        payment_ref: Option<String>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        match payment_ref {
            Some(payment_ref) => {
                diesel::update(orders::table.find(id))
                    .set((
                        orders::status.eq(status.as_str()),
                        orders::payment_ref.eq(payment_ref),
                        orders::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
            }
            None => {
                diesel::update(orders::table.find(id))
                    .set((orders::status.eq(status.as_str()), orders::updated_at.eq(now)))
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    async fn set_reservations_committed_at(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(orders::table.find(id))
            .set((
                orders::reservations_committed_at.eq(at),
                orders::updated_at.eq(at),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn claim_stock_decrement(
        &self,
        id: Uuid,
        location_id: i64,
        lines: &[ReservationLine],
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let lines = lines.to_vec();
        conn.transaction::<bool, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let claimed = diesel::update(
                    orders::table
                        .find(id)
                        .filter(orders::stock_decremented_at.is_null()),
                )
                .set((
                    orders::stock_decremented_at.eq(at),
                    orders::updated_at.eq(at),
                ))
                .execute(conn)
                .await?;
                if claimed == 0 {
                    return Ok(false);
                }

                // Same per-variant aggregation and update order as the
                // reserve transaction, so the two never deadlock.
                let mut sold: BTreeMap<Uuid, i64> = BTreeMap::new();
                for line in &lines {
                    *sold.entry(line.variant_id).or_default() += i64::from(line.quantity);
                }
                for (&variant_id, &quantity) in &sold {
                    diesel::update(
                        stock_levels::table
                            .filter(stock_levels::variant_id.eq(variant_id))
                            .filter(stock_levels::location_id.eq(location_id)),
                    )
                    .set((
                        stock_levels::on_hand.eq(stock_levels::on_hand - quantity),
                        stock_levels::updated_at.eq(at),
                    ))
                    .execute(conn)
                    .await?;
                }
                Ok(true)
            })
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn next_order_number(&self) -> Result<i64, StoreError> {
        #[derive(QueryableByName)]
        struct NextVal {
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            n: i64,
        }
        let mut conn = self.conn().await?;
        let row: NextVal = diesel::sql_query("SELECT nextval('order_number_seq') AS n")
            .get_result(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(row.n)
    }

    async fn stuck_pending_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<OrderRow> = orders::table
            .filter(orders::status.eq(OrderStatus::PendingPayment.as_str()))
            .filter(orders::created_at.lt(cutoff))
            .order(orders::created_at.asc())
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(Order::try_from).collect()
    }

    async fn insert_order_items(&self, items: &[NewOrderItem]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<OrderItemRow> = items.iter().map(OrderItemRow::from).collect();
        diesel::insert_into(order_items::table)
            .values(&rows)
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<OrderItemRow> = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(OrderItem::from).collect())
    }

    async fn upsert_variant(&self, variant: &Variant) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(product_variants::table)
            .values(&VariantRow::from(variant))
            .on_conflict(product_variants::id)
            .do_update()
            .set((
                product_variants::title.eq(variant.title.clone()),
                product_variants::sku.eq(variant.sku.clone()),
                product_variants::price.eq(variant.price.clone()),
                product_variants::inventory_item_id.eq(variant.inventory_item_id),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn variants_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Variant>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<VariantRow> = product_variants::table
            .filter(product_variants::id.eq_any(ids))
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(Variant::from).collect())
    }

    async fn variant_by_inventory_item(
        &self,
        inventory_item_id: i64,
    ) -> Result<Option<Variant>, StoreError> {
        let mut conn = self.conn().await?;
        let row: Option<VariantRow> = product_variants::table
            .filter(product_variants::inventory_item_id.eq(inventory_item_id))
            .first(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        Ok(row.map(Variant::from))
    }

    async fn insert_webhook_event(&self, event: &NewWebhookEvent) -> Result<(), StoreError> {
        use crate::schema::webhook_events;
        let mut conn = self.conn().await?;
        diesel::insert_into(webhook_events::table)
            .values(&NewWebhookEventRow::from(event))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
