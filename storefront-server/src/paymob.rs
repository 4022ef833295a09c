//! Paymob payment gateway client and callback verification.
//!
//! Starting a payment is three calls: authenticate with the API key, register
//! an order for the amount, then request a payment key scoped to the
//! integration. The customer is redirected to the hosted iframe with that key.
//!
//! Callbacks are authenticated with HMAC-SHA512 over the callback's fields
//! concatenated in ascending key order (the `hmac` field itself excluded),
//! keyed with the merchant HMAC secret.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use inventory_engine::checkout::{PaymentGateway, PaymentRequest};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha512;
use tracing::debug;

const API_BASE: &str = "https://accept.paymob.com/api";

pub struct PaymobClient {
    http: reqwest::Client,
    api_key: String,
    integration_id: i64,
    iframe_url: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentKeyResponse {
    token: String,
}

impl PaymobClient {
    pub fn new(api_key: String, integration_id: i64, iframe_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            integration_id,
            iframe_url,
        }
    }

    async fn authenticate(&self) -> anyhow::Result<String> {
        let resp: AuthResponse = self
            .http
            .post(format!("{API_BASE}/auth/tokens"))
            .json(&json!({ "api_key": self.api_key }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.token)
    }

    async fn register_order(
        &self,
        auth_token: &str,
        req: &PaymentRequest<'_>,
    ) -> anyhow::Result<i64> {
        let resp: OrderResponse = self
            .http
            .post(format!("{API_BASE}/ecommerce/orders"))
            .json(&json!({
                "auth_token": auth_token,
                "delivery_needed": "false",
                "amount_cents": req.amount_cents,
                "currency": req.currency,
                "merchant_order_id": req.order_id,
                "items": [],
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.id)
    }

    async fn payment_key(
        &self,
        auth_token: &str,
        gateway_order_id: i64,
        req: &PaymentRequest<'_>,
    ) -> anyhow::Result<String> {
        let mut names = req.customer.name.splitn(2, ' ');
        let first_name = names.next().unwrap_or("NA");
        let last_name = names.next().unwrap_or("NA");
        let resp: PaymentKeyResponse = self
            .http
            .post(format!("{API_BASE}/acceptance/payment_keys"))
            .json(&json!({
                "auth_token": auth_token,
                "amount_cents": req.amount_cents,
                "expiration": 3600,
                "order_id": gateway_order_id,
                "integration_id": self.integration_id,
                "currency": req.currency,
                "lock_order_when_paid": "false",
                "billing_data": {
                    "first_name": first_name,
                    "last_name": last_name,
                    "email": req.customer.email,
                    "phone_number": req.customer.phone,
                    "apartment": "NA",
                    "floor": "NA",
                    "street": "NA",
                    "building": "NA",
                    "city": "NA",
                    "country": "NA",
                },
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.token)
    }
}

#[async_trait]
impl PaymentGateway for PaymobClient {
    async fn create_payment(&self, req: PaymentRequest<'_>) -> anyhow::Result<String> {
        let auth_token = self.authenticate().await?;
        let gateway_order_id = self.register_order(&auth_token, &req).await?;
        debug!(order_id = %req.order_id, gateway_order_id, "registered gateway order");
        let payment_token = self.payment_key(&auth_token, gateway_order_id, &req).await?;
        Ok(format!(
            "{}?payment_token={}",
            self.iframe_url, payment_token
        ))
    }
}

/// The string the gateway signs: every field value concatenated in ascending
/// key order, with the `hmac` field itself left out.
pub fn concatenated_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(key, _)| key.as_str() != "hmac")
        .map(|(_, value)| value.as_str())
        .collect()
}

pub fn sign_callback(secret: &str, message: &str) -> String {
    let mut mac = match Hmac::<Sha512>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison against the hex signature the callback carried.
pub fn verify_callback(secret: &str, message: &str, received_hex: &str) -> bool {
    let Ok(received) = hex::decode(received_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha512>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&received).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn concatenation_is_sorted_by_key_and_skips_the_signature() {
        let p = params(&[
            ("success", "true"),
            ("amount_cents", "30000"),
            ("hmac", "deadbeef"),
            ("id", "991"),
        ]);
        assert_eq!(concatenated_params(&p), "30000991true");
    }

    #[test]
    fn signed_callbacks_verify_and_tampered_ones_do_not() {
        let secret = "test-hmac-secret";
        let message = "30000991true";
        let signature = sign_callback(secret, message);
        assert_eq!(signature.len(), 128);

        assert!(verify_callback(secret, message, &signature));
        assert!(!verify_callback(secret, "30000991false", &signature));
        assert!(!verify_callback("wrong-secret", message, &signature));
        assert!(!verify_callback(secret, message, "zz-not-hex"));
    }
}
