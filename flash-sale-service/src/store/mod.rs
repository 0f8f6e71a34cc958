//! Transactional store capability.
//!
//! A [`Store`] hands out [`Transaction`]s. Every `lock_*` method takes an
//! exclusive lock on the rows it returns that is held until the transaction
//! commits or rolls back. Nothing is visible to other transactions before
//! `commit`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{Hold, IdempotencyRecord, NewProduct, Order, OrderStatus, Product};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::StockLedger;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ProductRepository: Send {
    async fn insert_product(&mut self, product: NewProduct, now: DateTime<Utc>) -> Result<Product, StoreError>;

    async fn find_product(&mut self, id: Uuid) -> Result<Option<Product>, StoreError>;

    async fn lock_product(&mut self, id: Uuid) -> Result<Option<Product>, StoreError>;
}

#[async_trait]
pub trait HoldRepository: Send {
    async fn insert_hold(&mut self, hold: &Hold) -> Result<(), StoreError>;

    async fn lock_hold(&mut self, id: Uuid) -> Result<Option<Hold>, StoreError>;

    async fn lock_hold_by_token(&mut self, token: &str) -> Result<Option<Hold>, StoreError>;

    async fn find_hold_by_token(&mut self, token: &str) -> Result<Option<Hold>, StoreError>;

    async fn mark_hold_used(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Ids of unused holds with `expires_at <= now`, ascending, strictly
    /// after `after`, at most `limit` of them.
    async fn expired_hold_ids(
        &mut self,
        now: DateTime<Utc>,
        after: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait OrderRepository: Send {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn find_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn lock_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn lock_order_by_hold_token(&mut self, token: &str) -> Result<Option<Order>, StoreError>;

    async fn set_order_status(
        &mut self,
        id: Uuid,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdempotencyRepository: Send {
    async fn find_idempotency(&mut self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Fails with [`StoreError::UniqueViolation`] when the key already exists.
    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    async fn purge_idempotency(&mut self, expired_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait Transaction:
    StockLedger + ProductRepository + HoldRepository + OrderRepository + IdempotencyRepository + Send
{
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: Transaction + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}
