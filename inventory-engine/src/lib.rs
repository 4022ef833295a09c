//! Inventory reservation and reconciliation engine.
//!
//! The engine owns the correctness-critical parts of the storefront: holding
//! provisional claims on stock while a payment completes, committing or
//! releasing those claims, deduplicating retried webhooks, and driving the
//! decrement-once side effect towards the external source of truth. All state
//! lives behind [`store::LedgerStore`]; the engine keeps no availability or
//! reservation state of its own beyond a single call.

pub mod availability;
pub mod checkout;
pub mod error;
pub mod mem;
pub mod order;
pub mod reconcile;
pub mod reservation;
pub mod store;
pub mod sync;
pub mod testing;
pub mod webhook;

pub use error::{Error, Result};
