//! HTTP surface: checkout, inbound webhooks, admin order management, and the
//! scheduled-job triggers. Handlers authenticate and decode, then hand off to
//! the engine; every duplicate webhook is acknowledged with 200 so the sender
//! stops retrying.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use inventory_engine::availability;
use inventory_engine::checkout::{CheckoutReceipt, CheckoutService, PaymentGateway, PaymentRedirect};
use inventory_engine::order::{OrderLifecycle, PaymentOutcome};
use inventory_engine::reconcile;
use inventory_engine::reservation::ReservationManager;
use inventory_engine::store::LedgerStore;
use inventory_engine::sync::{self, CatalogSource, StockSync, StockUpdateOutcome};
use inventory_engine::webhook::{hash_payload, DedupGate};
use inventory_engine::Error as EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{CheckoutRequest, CustomerInfo, OrderStatus, ReservationLine, WebhookSource};
use tracing::{error, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{paymob, shopify};

#[derive(Clone)]
pub struct AppConfig {
    pub admin_token: String,
    pub location_id: i64,
    pub currency: String,
    pub shopify_webhook_secret: String,
    pub paymob_hmac_secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub stock: Arc<dyn StockSync>,
    pub catalog: Arc<dyn CatalogSource>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    fn checkout(&self) -> CheckoutService {
        CheckoutService::new(
            self.store.clone(),
            self.stock.clone(),
            self.config.location_id,
            self.config.currency.clone(),
        )
    }

    fn lifecycle(&self) -> OrderLifecycle {
        OrderLifecycle::new(self.store.clone(), self.stock.clone(), self.config.location_id)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<i64>,
}

impl ErrorResponse {
    fn message(error: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.into(),
            variant_id: None,
            requested: None,
            available: None,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::message(message)))
}

fn unauthorized() -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::message("unauthorized")),
    )
}

fn engine_error(err: EngineError) -> ApiError {
    match err {
        EngineError::InsufficientStock {
            variant_id,
            requested,
            available,
        } => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "insufficient stock".to_string(),
                variant_id: Some(variant_id),
                requested: Some(requested),
                available: Some(available),
            }),
        ),
        EngineError::VariantNotFound(id) => bad_request(format!("variant not found: {id}")),
        EngineError::OrderNotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::message(format!("order not found: {id}"))),
        ),
        EngineError::Validation(message) => bad_request(message),
        EngineError::Gateway(e) => {
            error!("payment gateway error: {e:#}");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::message("payment gateway error")),
            )
        }
        EngineError::Source(e) => {
            error!("stock source error: {e:#}");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::message("stock source error")),
            )
        }
        EngineError::Store(e) => {
            error!("store error: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::message("internal error")),
            )
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/checkout/cod", post(checkout_cod))
        .route("/checkout/card", post(checkout_card))
        .route("/availability/:variant_id", get(variant_availability))
        .route("/webhooks/payment", post(payment_webhook))
        .route("/webhooks/stock", post(stock_webhook))
        .route("/admin/orders", get(admin_list_orders))
        .route(
            "/admin/orders/:id",
            get(admin_get_order).patch(admin_update_order),
        )
        .route("/jobs/reservation-expiry", post(run_reservation_expiry))
        .route("/jobs/reconciliation", post(run_reconciliation))
        .route("/jobs/shopify-sync", post(run_shopify_sync))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

// --- checkout ---

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutPayload {
    #[validate(length(min = 1, message = "at least one item is required"))]
    pub items: Vec<CheckoutItemPayload>,
    #[validate(length(min = 1))]
    pub customer_name: String,
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 1))]
    pub customer_phone: String,
    pub shipping_address: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutItemPayload {
    pub variant_id: Uuid,
    pub quantity: i32,
}

impl CheckoutPayload {
    fn into_request(self) -> CheckoutRequest {
        CheckoutRequest {
            lines: self
                .items
                .iter()
                .map(|item| ReservationLine {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                })
                .collect(),
            customer: CustomerInfo {
                name: self.customer_name,
                email: self.customer_email,
                phone: self.customer_phone,
            },
            shipping_address: self.shipping_address,
        }
    }
}

pub async fn checkout_cod(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutPayload>,
) -> Result<Json<CheckoutReceipt>, ApiError> {
    payload.validate().map_err(|e| bad_request(e.to_string()))?;
    let request = payload.into_request();
    let receipt = state
        .checkout()
        .cash_on_delivery(&request)
        .await
        .map_err(engine_error)?;
    Ok(Json(receipt))
}

pub async fn checkout_card(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutPayload>,
) -> Result<Json<PaymentRedirect>, ApiError> {
    payload.validate().map_err(|e| bad_request(e.to_string()))?;
    let request = payload.into_request();
    let redirect = state
        .checkout()
        .card_init(&request, state.gateway.as_ref())
        .await
        .map_err(engine_error)?;
    Ok(Json(redirect))
}

pub async fn variant_availability(
    State(state): State<AppState>,
    Path(variant_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let available = availability::available(state.store.as_ref(), variant_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "variant_id": variant_id, "available": available })))
}

// --- webhooks ---

fn callback_params(headers: &HeaderMap, body: &str) -> Result<BTreeMap<String, String>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        let fields: BTreeMap<String, Value> =
            serde_json::from_str(body).map_err(|_| bad_request("malformed callback body"))?;
        Ok(fields
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    } else {
        serde_urlencoded::from_str(body).map_err(|_| bad_request("malformed callback body"))
    }
}

fn outcome_label(outcome: PaymentOutcome) -> &'static str {
    match outcome {
        PaymentOutcome::Paid => "paid",
        PaymentOutcome::Cancelled => "cancelled",
        PaymentOutcome::AlreadyProcessed => "already_processed",
    }
}

/// Gateway payment callback. Signature check first, then the dedup gate, then
/// the order transition. Retries of an already-logged callback are
/// acknowledged without touching the order.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let params = callback_params(&headers, &body)?;
    let received = params
        .get("hmac")
        .ok_or_else(|| bad_request("missing signature"))?;
    let message = paymob::concatenated_params(&params);
    if !paymob::verify_callback(&state.config.paymob_hmac_secret, &message, received) {
        return Err(unauthorized());
    }

    let order_id = params
        .get("merchant_order_id")
        .or_else(|| params.get("order_id"))
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| bad_request("missing or invalid order reference"))?;
    let payload_hash = hash_payload(body.as_bytes());
    let transaction_id = params
        .get("id")
        .or_else(|| params.get("transaction_id"))
        .cloned()
        .unwrap_or_else(|| payload_hash[..16].to_string());

    let gate = DedupGate::new(state.store.clone());
    let external_id = format!("{order_id}-{transaction_id}");
    if gate
        .is_duplicate(
            WebhookSource::Paymob,
            "payment_callback",
            &external_id,
            Some(payload_hash),
        )
        .await
        .map_err(engine_error)?
    {
        return Ok(Json(json!({ "ok": true, "duplicate": true })));
    }

    let success = params.get("success").map(|v| v.as_str() == "true").unwrap_or(false);
    let lifecycle = state.lifecycle();
    let outcome = if success {
        lifecycle
            .record_payment_success(order_id, Some(transaction_id))
            .await
    } else {
        lifecycle.record_payment_failure(order_id).await
    }
    .map_err(engine_error)?;

    Ok(Json(json!({
        "ok": true,
        "order_id": order_id,
        "outcome": outcome_label(outcome),
    })))
}

#[derive(Debug, Deserialize)]
pub struct StockUpdatePayload {
    pub inventory_item_id: Option<i64>,
    pub location_id: Option<i64>,
    pub available: Option<i64>,
}

/// Inventory-level update from the external stock source. Verified against
/// the raw body, deduplicated, then applied as an overwrite of on_hand.
pub async fn stock_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let received = headers
        .get("x-shopify-hmac-sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;
    if !shopify::verify_webhook(&state.config.shopify_webhook_secret, body.as_bytes(), received) {
        return Err(unauthorized());
    }

    let payload: StockUpdatePayload =
        serde_json::from_str(&body).map_err(|_| bad_request("malformed webhook body"))?;
    let payload_hash = hash_payload(body.as_bytes());
    let webhook_id = headers
        .get("x-shopify-webhook-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| payload_hash[..16].to_string());
    let external_id = format!(
        "{}-{}-{}",
        payload.inventory_item_id.map(|v| v.to_string()).unwrap_or_default(),
        payload.location_id.map(|v| v.to_string()).unwrap_or_default(),
        webhook_id,
    );

    let gate = DedupGate::new(state.store.clone());
    if gate
        .is_duplicate(
            WebhookSource::Shopify,
            "inventory_levels/update",
            &external_id,
            Some(payload_hash),
        )
        .await
        .map_err(engine_error)?
    {
        return Ok(Json(json!({ "ok": true, "duplicate": true })));
    }

    let (Some(inventory_item_id), Some(location_id), Some(available)) = (
        payload.inventory_item_id,
        payload.location_id,
        payload.available,
    ) else {
        warn!(%external_id, "stock update missing identifying fields, acknowledged unapplied");
        return Ok(Json(json!({ "ok": true, "applied": false, "reason": "missing_fields" })));
    };

    match sync::apply_stock_update(state.store.as_ref(), inventory_item_id, location_id, available)
        .await
        .map_err(engine_error)?
    {
        StockUpdateOutcome::Applied { variant_id } => Ok(Json(
            json!({ "ok": true, "applied": true, "variant_id": variant_id }),
        )),
        StockUpdateOutcome::UnknownVariant => Ok(Json(
            json!({ "ok": true, "applied": false, "reason": "unknown_variant" }),
        )),
    }
}

// --- admin ---

fn authorize(headers: &HeaderMap, config: &AppConfig) -> Result<(), ApiError> {
    use sha2::{Digest, Sha256};
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        // Digest comparison keeps the timing independent of the match length.
        Some(token)
            if !config.admin_token.is_empty()
                && Sha256::digest(token) == Sha256::digest(&config.admin_token) =>
        {
            Ok(())
        }
        _ => Err(unauthorized()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminOrdersQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn admin_list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AdminOrdersQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config)?;
    let status = match query.status.as_deref() {
        Some(s) => Some(OrderStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status: {s}")))?),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);
    let orders = state
        .store
        .orders_with_status(status, limit, offset)
        .await
        .map_err(|e| engine_error(e.into()))?;
    Ok(Json(json!({ "orders": orders })))
}

pub async fn admin_get_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config)?;
    let order = state
        .store
        .order(id)
        .await
        .map_err(|e| engine_error(e.into()))?
        .ok_or_else(|| engine_error(EngineError::OrderNotFound(id)))?;
    let items = state
        .store
        .order_items(id)
        .await
        .map_err(|e| engine_error(e.into()))?;
    Ok(Json(json!({ "order": order, "items": items })))
}

#[derive(Debug, Deserialize)]
pub struct AdminOrderUpdate {
    pub status: OrderStatus,
}

pub async fn admin_update_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(update): Json<AdminOrderUpdate>,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config)?;
    let order = state
        .lifecycle()
        .set_status(id, update.status)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "order": order })))
}

// --- jobs ---

pub async fn run_reservation_expiry(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config)?;
    let expired = ReservationManager::new(state.store.clone())
        .expire_stale()
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "ok": true, "expired": expired })))
}

pub async fn run_reconciliation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config)?;
    let report = reconcile::run(state.store.as_ref(), Utc::now())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "ok": true, "clean": report.is_clean(), "report": report })))
}

/// Full catalog pull from the external source: upserts every variant it
/// lists and overwrites the matching stock levels.
pub async fn run_shopify_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &state.config)?;
    let report = sync::run_bulk_sync(state.store.as_ref(), state.catalog.as_ref())
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "ok": true,
        "variants": report.variants,
        "levels": report.levels,
    })))
}

pub async fn health_check() -> &'static str {
    "OK"
}
