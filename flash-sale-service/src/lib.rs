//! Flash-sale inventory reservation and settlement engine.
//!
//! Buyers reserve units of a scarce product with short-lived holds, turn a
//! live hold into a pending order, and a payment gateway settles the order
//! through at-least-once webhooks. Stock is never oversold and every
//! notification is applied at most once.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod holds;
pub mod idempotency;
pub mod ledger;
pub mod models;
pub mod orders;
pub mod retry;
pub mod schema;
pub mod service;
pub mod settlement;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use error::{EngineError, EngineResult, LedgerOp, StoreError};
pub use service::FlashSaleService;
pub use store::{MemoryStore, PgStore, Store, Transaction};
