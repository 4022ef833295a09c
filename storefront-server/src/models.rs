use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use inventory_engine::store::StoreError;
use shared::{
    NewOrder, NewOrderItem, NewWebhookEvent, Order, OrderItem, OrderStatus, PaymentMethod,
    StockLevel, Variant,
};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::stock_levels)]
pub struct StockLevelRow {
    pub variant_id: Uuid,
    pub location_id: i64,
    pub inventory_item_id: Option<i64>,
    pub on_hand: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<StockLevelRow> for StockLevel {
    fn from(row: StockLevelRow) -> Self {
        StockLevel {
            variant_id: row.variant_id,
            location_id: row.location_id,
            inventory_item_id: row.inventory_item_id,
            on_hand: row.on_hand,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservationRow {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub order_id: Option<Uuid>,
    pub quantity: i32,
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub order_number: String,
    pub status: String,
    pub payment_method: String,
    pub total: BigDecimal,
    pub currency: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub shipping_address: Option<serde_json::Value>,
    pub payment_ref: Option<String>,
    pub reservations_committed_at: Option<DateTime<Utc>>,
    pub stock_decremented_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, StoreError> {
        let status = OrderStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Backend(format!("bad order status: {}", row.status)))?;
        let payment_method = PaymentMethod::parse(&row.payment_method).ok_or_else(|| {
            StoreError::Backend(format!("bad payment method: {}", row.payment_method))
        })?;
        Ok(Order {
            id: row.id,
            order_number: row.order_number,
            status,
            payment_method,
            total: row.total,
            currency: row.currency,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            customer_phone: row.customer_phone,
            shipping_address: row.shipping_address,
            payment_ref: row.payment_ref,
            reservations_committed_at: row.reservations_committed_at,
            stock_decremented_at: row.stock_decremented_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrderRow {
    pub id: Uuid,
    pub order_number: String,
    pub status: String,
    pub payment_method: String,
    pub total: BigDecimal,
    pub currency: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub shipping_address: Option<serde_json::Value>,
}

impl From<&NewOrder> for NewOrderRow {
    fn from(order: &NewOrder) -> Self {
        NewOrderRow {
            id: order.id,
            order_number: order.order_number.clone(),
            status: order.status.as_str().to_string(),
            payment_method: order.payment_method.as_str().to_string(),
            total: order.total.clone(),
            currency: order.currency.clone(),
            customer_name: order.customer_name.clone(),
            customer_email: order.customer_email.clone(),
            customer_phone: order.customer_phone.clone(),
            shipping_address: order.shipping_address.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItemRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub title: Option<String>,
    pub sku: Option<String>,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        OrderItem {
            id: row.id,
            order_id: row.order_id,
            variant_id: row.variant_id,
            quantity: row.quantity,
            unit_price: row.unit_price,
            title: row.title,
            sku: row.sku,
        }
    }
}

impl From<&NewOrderItem> for OrderItemRow {
    fn from(item: &NewOrderItem) -> Self {
        OrderItemRow {
            id: item.id,
            order_id: item.order_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
            unit_price: item.unit_price.clone(),
            title: item.title.clone(),
            sku: item.sku.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::product_variants)]
pub struct VariantRow {
    pub id: Uuid,
    pub title: Option<String>,
    pub sku: Option<String>,
    pub price: BigDecimal,
    pub inventory_item_id: Option<i64>,
}

impl From<&Variant> for VariantRow {
    fn from(variant: &Variant) -> Self {
        VariantRow {
            id: variant.id,
            title: variant.title.clone(),
            sku: variant.sku.clone(),
            price: variant.price.clone(),
            inventory_item_id: variant.inventory_item_id,
        }
    }
}

impl From<VariantRow> for Variant {
    fn from(row: VariantRow) -> Self {
        Variant {
            id: row.id,
            title: row.title,
            sku: row.sku,
            price: row.price,
            inventory_item_id: row.inventory_item_id,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::webhook_events)]
pub struct NewWebhookEventRow {
    pub id: Uuid,
    pub source: String,
    pub topic: String,
    pub external_id: String,
    pub payload_hash: Option<String>,
}

impl From<&NewWebhookEvent> for NewWebhookEventRow {
    fn from(event: &NewWebhookEvent) -> Self {
        NewWebhookEventRow {
            id: Uuid::new_v4(),
            source: event.source.as_str().to_string(),
            topic: event.topic.clone(),
            external_id: event.external_id.clone(),
            payload_hash: event.payload_hash.clone(),
        }
    }
}
