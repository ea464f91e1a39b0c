//! ShopFlow backend library.
//!
//! Payment gateway orchestration and order reconciliation: gateway
//! adapters, the idempotent payment ledger, order state transitions,
//! webhook intake, and the background reconciler.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
