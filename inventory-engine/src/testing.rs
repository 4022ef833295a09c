//! Test doubles for the external collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::checkout::{PaymentGateway, PaymentRequest};
use crate::sync::{CatalogEntry, CatalogSource, StockSync};

/// Records every adjust call; optionally fails all of them.
#[derive(Default)]
pub struct RecordingStockSync {
    calls: Mutex<Vec<(i64, i64, i64)>>,
    failing: AtomicBool,
}

impl RecordingStockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// (inventory_item_id, location_id, delta) per successful call.
    pub fn adjustments(&self) -> Vec<(i64, i64, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StockSync for RecordingStockSync {
    async fn adjust(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        delta: i64,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("stock source unavailable");
        }
        self.calls
            .lock()
            .unwrap()
            .push((inventory_item_id, location_id, delta));
        Ok(())
    }
}

/// Serves a fixed catalog snapshot; optionally fails the fetch.
#[derive(Default)]
pub struct FixedCatalogSource {
    entries: Mutex<Vec<CatalogEntry>>,
    failing: AtomicBool,
}

impl FixedCatalogSource {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogSource for FixedCatalogSource {
    async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("catalog source unavailable");
        }
        Ok(self.entries.lock().unwrap().clone())
    }
}

/// Returns a fixed redirect URL and remembers what was requested.
#[derive(Default)]
pub struct StaticPaymentGateway {
    requests: Mutex<Vec<(Uuid, i64)>>,
    failing: AtomicBool,
}

impl StaticPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(Uuid, i64)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for StaticPaymentGateway {
    async fn create_payment(&self, req: PaymentRequest<'_>) -> anyhow::Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("payment gateway unavailable");
        }
        self.requests
            .lock()
            .unwrap()
            .push((req.order_id, req.amount_cents));
        Ok(format!(
            "https://pay.example/iframe?payment_token=test-{}",
            req.order_id
        ))
    }
}
