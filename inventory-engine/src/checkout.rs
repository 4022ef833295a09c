//! Checkout orchestration: price, reserve, create the order, and either
//! commit immediately (cash on delivery) or hand off to the payment gateway.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use num_traits::ToPrimitive;
use serde::Serialize;
use shared::{
    CheckoutRequest, CustomerInfo, NewOrder, NewOrderItem, OrderStatus, PaymentMethod, Variant,
};
use tracing::info;
use uuid::Uuid;

use crate::order::OrderLifecycle;
use crate::reservation::ReservationManager;
use crate::store::LedgerStore;
use crate::sync::StockSync;
use crate::{Error, Result};

/// Everything the gateway needs to register a payment and hand back a
/// redirect URL.
pub struct PaymentRequest<'a> {
    pub order_id: Uuid,
    pub order_number: &'a str,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub customer: &'a CustomerInfo,
}

/// Payment-gateway seam. Verification of the eventual callback lives with the
/// transport; this trait only starts a payment.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Registers the payment and returns the customer-facing redirect URL.
    async fn create_payment(&self, req: PaymentRequest<'_>) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutReceipt {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub total: BigDecimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRedirect {
    pub order_id: Uuid,
    pub order_number: String,
    pub redirect_url: String,
    pub total: BigDecimal,
}

struct PricedCheckout {
    total: BigDecimal,
    items: Vec<(Uuid, i32, Variant)>,
}

pub struct CheckoutService {
    store: Arc<dyn LedgerStore>,
    reservations: ReservationManager,
    orders: OrderLifecycle,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        stock: Arc<dyn StockSync>,
        location_id: i64,
        currency: String,
    ) -> Self {
        let reservations = ReservationManager::new(store.clone());
        let orders = OrderLifecycle::new(store.clone(), stock, location_id);
        Self {
            store,
            reservations,
            orders,
            currency,
        }
    }

    /// Cash on delivery: the order is confirmed synchronously, so the
    /// reservations are committed and external stock decremented in-line.
    pub async fn cash_on_delivery(&self, req: &CheckoutRequest) -> Result<CheckoutReceipt> {
        let priced = self.price(req).await?;
        let (order_id, order_number) = self
            .place_order(req, &priced, OrderStatus::CodConfirmed, PaymentMethod::CashOnDelivery)
            .await?;

        self.reservations.commit(order_id).await?;
        self.store
            .set_reservations_committed_at(order_id, chrono::Utc::now())
            .await?;
        self.orders.decrement_stock_once(order_id).await?;

        info!(%order_id, %order_number, "cash-on-delivery order confirmed");
        Ok(CheckoutReceipt {
            order_id,
            order_number,
            status: OrderStatus::CodConfirmed,
            total: priced.total,
        })
    }

    /// Card payment: the order waits in `pending_payment` while the customer
    /// completes the gateway flow; the webhook finishes or cancels it. If the
    /// customer walks away, the reservations ride out their TTL.
    pub async fn card_init(
        &self,
        req: &CheckoutRequest,
        gateway: &dyn PaymentGateway,
    ) -> Result<PaymentRedirect> {
        let priced = self.price(req).await?;
        let (order_id, order_number) = self
            .place_order(req, &priced, OrderStatus::PendingPayment, PaymentMethod::Card)
            .await?;

        let amount_cents = (priced.total.clone() * BigDecimal::from(100))
            .with_scale(0)
            .to_i64()
            .ok_or_else(|| Error::Validation("order total out of range".into()))?;
        let redirect_url = gateway
            .create_payment(PaymentRequest {
                order_id,
                order_number: &order_number,
                amount_cents,
                currency: &self.currency,
                customer: &req.customer,
            })
            .await
            .map_err(Error::Gateway)?;

        info!(%order_id, %order_number, "card payment initiated");
        Ok(PaymentRedirect {
            order_id,
            order_number,
            redirect_url,
            total: priced.total,
        })
    }

    /// Rejects malformed input and resolves each line against the catalog
    /// snapshot, before anything is reserved or written.
    async fn price(&self, req: &CheckoutRequest) -> Result<PricedCheckout> {
        if req.lines.is_empty() {
            return Err(Error::Validation("no items in checkout".into()));
        }
        if req.customer.name.trim().is_empty()
            || req.customer.phone.trim().is_empty()
            || !req.customer.email.contains('@')
        {
            return Err(Error::Validation("incomplete customer contact".into()));
        }
        for line in &req.lines {
            if line.quantity < 1 {
                return Err(Error::Validation(format!(
                    "invalid quantity {} for variant {}",
                    line.quantity, line.variant_id
                )));
            }
        }

        let mut ids: Vec<Uuid> = req.lines.iter().map(|l| l.variant_id).collect();
        ids.sort();
        ids.dedup();
        let variants: HashMap<Uuid, Variant> = self
            .store
            .variants_by_ids(&ids)
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        let mut total = BigDecimal::from(0);
        let mut items = Vec::with_capacity(req.lines.len());
        for line in &req.lines {
            let variant = variants
                .get(&line.variant_id)
                .ok_or(Error::VariantNotFound(line.variant_id))?;
            total += variant.price.clone() * BigDecimal::from(line.quantity);
            items.push((line.variant_id, line.quantity, variant.clone()));
        }
        Ok(PricedCheckout {
            total: total.with_scale(2),
            items,
        })
    }

    /// Reserves units, then writes the order row and its item snapshot.
    /// Reservations go in first, already linked to the order id: if a later
    /// step fails the claims self-heal through the TTL instead of leaving
    /// oversold state behind.
    async fn place_order(
        &self,
        req: &CheckoutRequest,
        priced: &PricedCheckout,
        status: OrderStatus,
        payment_method: PaymentMethod,
    ) -> Result<(Uuid, String)> {
        let order_id = Uuid::new_v4();
        let order_number = format!("ORD-{}", self.store.next_order_number().await?);

        self.reservations.reserve(Some(order_id), &req.lines).await?;

        self.store
            .insert_order(&NewOrder {
                id: order_id,
                order_number: order_number.clone(),
                status,
                payment_method,
                total: priced.total.clone(),
                currency: self.currency.clone(),
                customer_name: req.customer.name.clone(),
                customer_email: req.customer.email.clone(),
                customer_phone: req.customer.phone.clone(),
                shipping_address: req.shipping_address.clone(),
            })
            .await?;

        let item_rows: Vec<NewOrderItem> = priced
            .items
            .iter()
            .map(|(variant_id, quantity, variant)| NewOrderItem {
                id: Uuid::new_v4(),
                order_id,
                variant_id: *variant_id,
                quantity: *quantity,
                unit_price: variant.price.clone(),
                title: variant.title.clone(),
                sku: variant.sku.clone(),
            })
            .collect();
        self.store.insert_order_items(&item_rows).await?;

        Ok((order_id, order_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability;
    use crate::mem::MemoryLedger;
    use crate::testing::{RecordingStockSync, StaticPaymentGateway};
    use shared::{ReservationLine, ReservationStatus};
    use std::str::FromStr;

    const LOCATION: i64 = 7;

    struct Fixture {
        store: Arc<MemoryLedger>,
        stock: Arc<RecordingStockSync>,
        checkout: CheckoutService,
        variant_id: Uuid,
    }

    fn fixture(on_hand: i64) -> Fixture {
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
        store.set_stock(variant_id, LOCATION, Some(42), on_hand);
        let checkout =
            CheckoutService::new(store.clone(), stock.clone(), LOCATION, "EGP".into());
        Fixture {
            store,
            stock,
            checkout,
            variant_id,
        }
    }

    fn request(variant_id: Uuid, quantity: i32) -> CheckoutRequest {
        CheckoutRequest {
            lines: vec![ReservationLine {
                variant_id,
                quantity,
            }],
            customer: CustomerInfo {
                name: "A Customer".into(),
                email: "a@example.com".into(),
                phone: "+201000000000".into(),
            },
            shipping_address: None,
        }
    }

    #[tokio::test]
    async fn cod_checkout_commits_and_decrements_in_line() {
        let fx = fixture(5);

        let receipt = fx
            .checkout
            .cash_on_delivery(&request(fx.variant_id, 2))
            .await
            .unwrap();
        assert_eq!(receipt.status, OrderStatus::CodConfirmed);
        assert_eq!(receipt.total, BigDecimal::from_str("300.00").unwrap());
        assert!(receipt.order_number.starts_with("ORD-"));

        let order = fx.store.order(receipt.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::CodConfirmed);
        assert!(order.reservations_committed_at.is_some());
        assert!(order.stock_decremented_at.is_some());
        assert!(fx
            .store
            .reservations_for_order(receipt.order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Committed));
        assert_eq!(fx.stock.adjustments(), vec![(42, LOCATION, -2)]);

        let items = fx.store.order_items(receipt.order_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(items[0].unit_price, BigDecimal::from_str("150.00").unwrap());
    }

    #[tokio::test]
    async fn card_init_leaves_the_order_pending_with_active_claims() {
        let fx = fixture(5);
        let gateway = StaticPaymentGateway::new();

        let redirect = fx
            .checkout
            .card_init(&request(fx.variant_id, 2), &gateway)
            .await
            .unwrap();
        assert!(redirect.redirect_url.contains("payment_token"));
        assert_eq!(gateway.requests(), vec![(redirect.order_id, 30000)]);

        let order = fx.store.order(redirect.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert!(order.stock_decremented_at.is_none());
        assert!(fx
            .store
            .reservations_for_order(redirect.order_id)
            .iter()
            .all(|r| r.status == ReservationStatus::Active));
        // Units are held even though nothing is committed yet.
        assert_eq!(
            availability::available(fx.store.as_ref(), fx.variant_id)
                .await
                .unwrap(),
            3
        );
        assert!(fx.stock.adjustments().is_empty());
    }

    #[tokio::test]
    async fn insufficient_stock_writes_nothing() {
        let fx = fixture(1);

        let err = fx
            .checkout
            .cash_on_delivery(&request(fx.variant_id, 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientStock {
                requested: 2,
                available: 1,
                ..
            }
        ));
        assert!(fx
            .store
            .orders_with_status(None, 10, 0)
            .await
            .unwrap()
            .is_empty());
        assert!(fx.store.reservations_for_variant(fx.variant_id).is_empty());
    }

    #[tokio::test]
    async fn concurrent_checkouts_cannot_both_take_the_last_unit() {
        let fx = fixture(1);
        let second =
            CheckoutService::new(fx.store.clone(), fx.stock.clone(), LOCATION, "EGP".into());

        let req_a = request(fx.variant_id, 1);
        let req_b = request(fx.variant_id, 1);
        let (a, b) = tokio::join!(
            fx.checkout.cash_on_delivery(&req_a),
            second.cash_on_delivery(&req_b),
        );
        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert_eq!(fx.stock.adjustments().len(), 1);
    }

    #[tokio::test]
    async fn unknown_variant_is_rejected_before_reserving() {
        let fx = fixture(5);
        let ghost = Uuid::new_v4();

        let err = fx
            .checkout
            .cash_on_delivery(&request(ghost, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VariantNotFound(id) if id == ghost));
        assert!(fx.store.reservations_for_variant(ghost).is_empty());
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_before_any_mutation() {
        let fx = fixture(5);

        let mut no_email = request(fx.variant_id, 1);
        no_email.customer.email = "not-an-email".into();
        assert!(matches!(
            fx.checkout.cash_on_delivery(&no_email).await.unwrap_err(),
            Error::Validation(_)
        ));

        let empty = CheckoutRequest {
            lines: vec![],
            customer: no_email.customer.clone(),
            shipping_address: None,
        };
        assert!(matches!(
            fx.checkout.cash_on_delivery(&empty).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert!(fx.store.reservations_for_variant(fx.variant_id).is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_leaves_a_pending_order_that_ttl_will_heal() {
        let fx = fixture(5);
        let gateway = StaticPaymentGateway::new();
        gateway.set_failing(true);

        let err = fx
            .checkout
            .card_init(&request(fx.variant_id, 1), &gateway)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));

        // The order and its claims exist; the TTL sweep reclaims the units.
        let pending = fx
            .store
            .orders_with_status(Some(OrderStatus::PendingPayment), 10, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            availability::available(fx.store.as_ref(), fx.variant_id)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn order_numbers_are_monotonic() {
        let fx = fixture(10);

        let first = fx
            .checkout
            .cash_on_delivery(&request(fx.variant_id, 1))
            .await
            .unwrap();
        let second = fx
            .checkout
            .cash_on_delivery(&request(fx.variant_id, 1))
            .await
            .unwrap();
        assert_eq!(first.order_number, "ORD-1000");
        assert_eq!(second.order_number, "ORD-1001");
    }
}
