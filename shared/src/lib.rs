use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single reserved unit. `Active` is the only non-terminal
/// state; the other three are terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Committed,
    Expired,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Released => "released",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReservationStatus::Active),
            "committed" => Some(ReservationStatus::Committed),
            "expired" => Some(ReservationStatus::Expired),
            "released" => Some(ReservationStatus::Released),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    CodConfirmed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::CodConfirmed => "cod_confirmed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(OrderStatus::PendingPayment),
            "paid" => Some(OrderStatus::Paid),
            "cod_confirmed" => Some(OrderStatus::CodConfirmed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Statuses that mean units were sold and external stock must reflect it.
    pub fn is_fulfilling(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::CodConfirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "card")]
    Card,
    #[serde(rename = "cod")]
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::CashOnDelivery => "cod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "card" => Some(PaymentMethod::Card),
            "cod" => Some(PaymentMethod::CashOnDelivery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Shopify,
    Paymob,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::Shopify => "shopify",
            WebhookSource::Paymob => "paymob",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shopify" => Some(WebhookSource::Shopify),
            "paymob" => Some(WebhookSource::Paymob),
            _ => None,
        }
    }
}

/// On-hand quantity for one variant at one location, as last synced from the
/// external source of truth. Checkout never writes this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLevel {
    pub variant_id: Uuid,
    pub location_id: i64,
    pub inventory_item_id: Option<i64>,
    pub on_hand: i64,
    pub updated_at: DateTime<Utc>,
}

/// One provisional claim on one unit of stock. Rows are append-only; status
/// transitions are the only mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub order_id: Option<Uuid>,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
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

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub total: BigDecimal,
    pub currency: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub shipping_address: Option<serde_json::Value>,
}

/// Immutable snapshot of a purchased line, decoupled from later catalog edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub title: Option<String>,
    pub sku: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub title: Option<String>,
    pub sku: Option<String>,
}

/// Catalog snapshot used to price checkouts and map inbound inventory item
/// references back to variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub title: Option<String>,
    pub sku: Option<String>,
    pub price: BigDecimal,
    pub inventory_item_id: Option<i64>,
}

/// Dedup-log entry for an inbound notification. Existence of a row with the
/// same (source, topic, external_id) is itself the duplicate signal.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub source: WebhookSource,
    pub topic: String,
    pub external_id: String,
    pub payload_hash: Option<String>,
}

/// One requested checkout line: how many units of which variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReservationLine {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub lines: Vec<ReservationLine>,
    pub customer: CustomerInfo,
    pub shipping_address: Option<serde_json::Value>,
}
