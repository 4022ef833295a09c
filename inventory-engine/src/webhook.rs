//! Idempotency gate for inbound asynchronous notifications.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use shared::{NewWebhookEvent, WebhookSource};
use tracing::info;

use crate::store::{LedgerStore, StoreError};
use crate::Result;

/// Hex SHA-256 of a raw webhook body, stored alongside the dedup key so a
/// replayed id with different content can be spotted during investigation.
pub fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Shared dedup filter for every inbound notification. Upstream senders
/// deliver at-least-once and may retry indefinitely with identical
/// identifiers; this gate is the only synchronization they need.
pub struct DedupGate {
    store: Arc<dyn LedgerStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Attempts to log the event. A unique-constraint rejection means this
    /// exact event was already processed: the caller must skip reprocessing
    /// and acknowledge. Any other store error propagates.
    pub async fn is_duplicate(
        &self,
        source: WebhookSource,
        topic: &str,
        external_id: &str,
        payload_hash: Option<String>,
    ) -> Result<bool> {
        let event = NewWebhookEvent {
            source,
            topic: topic.to_string(),
            external_id: external_id.to_string(),
            payload_hash,
        };
        match self.store.insert_webhook_event(&event).await {
            Ok(()) => Ok(false),
            Err(StoreError::UniqueViolation) => {
                info!(source = source.as_str(), topic, external_id, "duplicate webhook");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryLedger;

    #[tokio::test]
    async fn first_delivery_passes_then_all_retries_are_duplicates() {
        let gate = DedupGate::new(Arc::new(MemoryLedger::new()));

        let first = gate
            .is_duplicate(WebhookSource::Paymob, "payment_callback", "ord-1-tx-9", None)
            .await
            .unwrap();
        assert!(!first);

        for _ in 0..3 {
            let retry = gate
                .is_duplicate(WebhookSource::Paymob, "payment_callback", "ord-1-tx-9", None)
                .await
                .unwrap();
            assert!(retry);
        }
    }

    #[tokio::test]
    async fn key_is_scoped_by_source_and_topic() {
        let gate = DedupGate::new(Arc::new(MemoryLedger::new()));

        assert!(!gate
            .is_duplicate(WebhookSource::Paymob, "payment_callback", "ev-1", None)
            .await
            .unwrap());
        assert!(!gate
            .is_duplicate(WebhookSource::Shopify, "payment_callback", "ev-1", None)
            .await
            .unwrap());
        assert!(!gate
            .is_duplicate(WebhookSource::Paymob, "refund_callback", "ev-1", None)
            .await
            .unwrap());
    }

    #[test]
    fn payload_hash_is_stable_hex_sha256() {
        let a = hash_payload(b"{\"ok\":true}");
        let b = hash_payload(b"{\"ok\":true}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_payload(b"{\"ok\":false}"));
    }
}
