use uuid::Uuid;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error taxonomy. Duplicate notifications are deliberately absent:
/// a recognized duplicate is an `Ok` outcome, not an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Checkout rejected; nothing was reserved. The client should re-fetch
    /// availability and retry.
    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("variant not found: {0}")]
    VariantNotFound(Uuid),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    /// Malformed input, rejected before any reservation or order mutation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Payment gateway refused or failed while starting a payment. The order
    /// and its reservations remain; the TTL reclaims the held units.
    #[error("payment gateway error: {0}")]
    Gateway(anyhow::Error),

    /// External stock source failed while serving a catalog fetch. Nothing
    /// fetched so far is rolled back; the next sync overwrites it anyway.
    #[error("stock source error: {0}")]
    Source(anyhow::Error),

    /// Transactional store unreachable or violated a constraint unexpectedly.
    /// Fatal for the current request.
    #[error(transparent)]
    Store(#[from] StoreError),
}
