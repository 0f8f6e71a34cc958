//! PostgreSQL store.
//!
//! Each transaction owns a pooled connection for its whole lifetime. Row
//! locks come from `SELECT ... FOR UPDATE`; `lock_timeout` is set per
//! transaction so a blocked writer gives up instead of queueing forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::{Hold, IdempotencyRecord, NewProduct, Order, OrderStatus, Product};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::{HoldRepository, IdempotencyRepository, OrderRepository, ProductRepository, Store, Transaction};
use crate::error::StoreError;
use crate::ledger::StockLedger;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConnection = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::UniqueViolation(info.constraint_name().unwrap_or(info.message()).to_string())
            }
            DieselError::DatabaseError(_, info) if is_lock_failure(info.message()) => {
                StoreError::Conflict(info.message().to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

// Deadlocks (40P01) and lock timeouts (55P03) carry no dedicated diesel kind.
fn is_lock_failure(message: &str) -> bool {
    message.contains("deadlock detected") || message.contains("lock timeout") || message.contains("could not obtain lock")
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub async fn connect(database_url: &str, lock_timeout: Duration) -> Result<Self, StoreError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .build(config)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool, lock_timeout))
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let mut conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        diesel::sql_query(format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis()))
            .execute(&mut *conn)
            .await?;

        Ok(PgTransaction { conn })
    }
}

pub struct PgTransaction {
    conn: PooledConnection,
}

impl PgTransaction {
    fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(mut self) -> Result<(), StoreError> {
        AnsiTransactionManager::commit_transaction(self.conn()).await?;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        if let Err(e) = AnsiTransactionManager::rollback_transaction(self.conn()).await {
            warn!("Rollback failed, dropping connection: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl StockLedger for PgTransaction {
    async fn reserve_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError> {
        if quantity <= 0 {
            return Ok(false);
        }
        let updated = diesel::update(
            products::table
                .filter(products::id.eq(product_id))
                .filter((products::stock - products::reserved).ge(quantity)),
        )
        .set(products::reserved.eq(products::reserved + quantity))
        .execute(self.conn())
        .await?;
        Ok(updated > 0)
    }

    async fn release_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError> {
        if quantity <= 0 {
            return Ok(false);
        }
        let updated = diesel::update(
            products::table
                .filter(products::id.eq(product_id))
                .filter(products::reserved.ge(quantity)),
        )
        .set(products::reserved.eq(products::reserved - quantity))
        .execute(self.conn())
        .await?;
        Ok(updated > 0)
    }

    async fn commit_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError> {
        if quantity <= 0 {
            return Ok(false);
        }
        let updated = diesel::update(
            products::table
                .filter(products::id.eq(product_id))
                .filter(products::reserved.ge(quantity)),
        )
        .set((
            products::stock.eq(products::stock - quantity),
            products::reserved.eq(products::reserved - quantity),
        ))
        .execute(self.conn())
        .await?;
        Ok(updated > 0)
    }
}

#[async_trait]
impl ProductRepository for PgTransaction {
    async fn insert_product(&mut self, product: NewProduct, now: DateTime<Utc>) -> Result<Product, StoreError> {
        let product = Product {
            id: Uuid::new_v4(),
            name: product.name,
            description: product.description,
            price: product.price,
            stock: product.stock,
            reserved: 0,
            created_at: now,
        };
        diesel::insert_into(products::table)
            .values(&ProductRow::from(&product))
            .execute(self.conn())
            .await?;
        Ok(product)
    }

    async fn find_product(&mut self, id: Uuid) -> Result<Option<Product>, StoreError> {
        let row = products::table
            .find(id)
            .first::<ProductRow>(self.conn())
            .await
            .optional()?;
        Ok(row.map(Product::from))
    }

    async fn lock_product(&mut self, id: Uuid) -> Result<Option<Product>, StoreError> {
        let row = products::table
            .find(id)
            .for_update()
            .first::<ProductRow>(self.conn())
            .await
            .optional()?;
        Ok(row.map(Product::from))
    }
}

#[async_trait]
impl HoldRepository for PgTransaction {
    async fn insert_hold(&mut self, hold: &Hold) -> Result<(), StoreError> {
        diesel::insert_into(holds::table)
            .values(&HoldRow::from(hold))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn lock_hold(&mut self, id: Uuid) -> Result<Option<Hold>, StoreError> {
        let row = holds::table
            .find(id)
            .for_update()
            .first::<HoldRow>(self.conn())
            .await
            .optional()?;
        Ok(row.map(Hold::from))
    }

    async fn lock_hold_by_token(&mut self, token: &str) -> Result<Option<Hold>, StoreError> {
        let row = holds::table
            .filter(holds::token.eq(token))
            .for_update()
            .first::<HoldRow>(self.conn())
            .await
            .optional()?;
        Ok(row.map(Hold::from))
    }

    async fn find_hold_by_token(&mut self, token: &str) -> Result<Option<Hold>, StoreError> {
        let row = holds::table
            .filter(holds::token.eq(token))
            .first::<HoldRow>(self.conn())
            .await
            .optional()?;
        Ok(row.map(Hold::from))
    }

    async fn mark_hold_used(&mut self, id: Uuid) -> Result<(), StoreError> {
        diesel::update(holds::table.find(id))
            .set(holds::used.eq(true))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn expired_hold_ids(
        &mut self,
        now: DateTime<Utc>,
        after: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids = holds::table
            .select(holds::id)
            .filter(holds::used.eq(false))
            .filter(holds::expires_at.le(now))
            .filter(holds::id.gt(after))
            .order(holds::id.asc())
            .limit(limit)
            .load::<Uuid>(self.conn())
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl OrderRepository for PgTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        diesel::insert_into(orders::table)
            .values(&OrderRow::from(order))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn find_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = orders::table
            .find(id)
            .first::<OrderRow>(self.conn())
            .await
            .optional()?;
        row.map(Order::try_from).transpose()
    }

    async fn lock_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = orders::table
            .find(id)
            .for_update()
            .first::<OrderRow>(self.conn())
            .await
            .optional()?;
        row.map(Order::try_from).transpose()
    }

    async fn lock_order_by_hold_token(&mut self, token: &str) -> Result<Option<Order>, StoreError> {
        let hold_id = holds::table
            .filter(holds::token.eq(token))
            .select(holds::id)
            .first::<Uuid>(self.conn())
            .await
            .optional()?;

        let Some(hold_id) = hold_id else {
            return Ok(None);
        };

        let row = orders::table
            .filter(orders::hold_id.eq(hold_id))
            .for_update()
            .first::<OrderRow>(self.conn())
            .await
            .optional()?;
        row.map(Order::try_from).transpose()
    }

    async fn set_order_status(
        &mut self,
        id: Uuid,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        diesel::update(orders::table.find(id))
            .set((orders::status.eq(status.as_str()), orders::updated_at.eq(now)))
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyRepository for PgTransaction {
    async fn find_idempotency(&mut self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = idempotency_records::table
            .find(key)
            .first::<IdempotencyRow>(self.conn())
            .await
            .optional()?;
        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        diesel::insert_into(idempotency_records::table)
            .values(&IdempotencyRow::from(record))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn purge_idempotency(&mut self, expired_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = diesel::delete(
            idempotency_records::table.filter(idempotency_records::expires_at.le(expired_before)),
        )
        .execute(self.conn())
        .await?;
        Ok(deleted as u64)
    }
}
