//! External stock source seam, inbound stock-update application, and the
//! bulk catalog sync.

use async_trait::async_trait;
use serde::Serialize;
use shared::Variant;
use tracing::info;
use uuid::Uuid;

use crate::store::LedgerStore;
use crate::{Error, Result};

/// Client for the external inventory source of truth. `adjust` is NOT assumed
/// idempotent; callers must guard against double-calls via the decrement-once
/// check on the order.
#[async_trait]
pub trait StockSync: Send + Sync {
    async fn adjust(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        delta: i64,
    ) -> anyhow::Result<()>;
}

/// One catalog variant together with its per-location availability,
/// as `(location_id, available)` pairs.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub variant: Variant,
    pub levels: Vec<(i64, i64)>,
}

/// Read side of the external inventory source: the full catalog snapshot.
/// Implementations page through the source themselves and return the
/// flattened result.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>>;
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BulkSyncReport {
    pub variants: usize,
    pub levels: usize,
}

/// Pulls the whole catalog from the source and overwrites the local snapshot:
/// every variant row and every (variant, location) on_hand it reports.
/// Variants the source no longer lists are left in place rather than deleted,
/// so order-item history keeps resolving.
pub async fn run_bulk_sync(
    store: &dyn LedgerStore,
    source: &dyn CatalogSource,
) -> Result<BulkSyncReport> {
    let entries = source.fetch_catalog().await.map_err(Error::Source)?;

    let mut levels = 0usize;
    let variants = entries.len();
    for entry in &entries {
        store.upsert_variant(&entry.variant).await?;
        for (location_id, available) in &entry.levels {
            store
                .upsert_stock_level(
                    entry.variant.id,
                    *location_id,
                    entry.variant.inventory_item_id,
                    *available,
                )
                .await?;
            levels += 1;
        }
    }

    info!(variants, levels, "bulk stock sync applied");
    Ok(BulkSyncReport { variants, levels })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockUpdateOutcome {
    Applied { variant_id: Uuid },
    UnknownVariant,
}

/// Applies a verified inventory-level notification: maps the external item
/// reference to a variant and overwrites that variant's on_hand at the
/// location. This is the one path (besides bulk sync) that mutates on_hand.
pub async fn apply_stock_update(
    store: &dyn LedgerStore,
    inventory_item_id: i64,
    location_id: i64,
    new_on_hand: i64,
) -> Result<StockUpdateOutcome> {
    let Some(variant) = store.variant_by_inventory_item(inventory_item_id).await? else {
        return Ok(StockUpdateOutcome::UnknownVariant);
    };
    store
        .upsert_stock_level(variant.id, location_id, Some(inventory_item_id), new_on_hand)
        .await?;
    info!(variant_id = %variant.id, location_id, new_on_hand, "applied stock update");
    Ok(StockUpdateOutcome::Applied {
        variant_id: variant.id,
    })
}
