//! In-process store.
//!
//! One async mutex guards all tables, so a transaction holds every row lock
//! at once from `begin` until it finishes. Writes go straight to the shared
//! tables and each one pushes the value it replaced onto an undo log. Commit
//! discards the log; rollback, or dropping the transaction, replays it in
//! reverse. Starting a transaction costs nothing regardless of table size.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{Hold, IdempotencyRecord, NewProduct, Order, OrderStatus, Product};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{HoldRepository, IdempotencyRepository, OrderRepository, ProductRepository, Store, Transaction};
use crate::error::StoreError;
use crate::ledger::StockLedger;

#[derive(Debug, Default)]
struct Tables {
    products: HashMap<Uuid, Product>,
    holds: BTreeMap<Uuid, Hold>,
    hold_tokens: HashMap<String, Uuid>,
    orders: HashMap<Uuid, Order>,
    orders_by_hold: HashMap<Uuid, Uuid>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

/// Prior state of one row, `None` when the row did not exist.
#[derive(Debug)]
enum Undo {
    Product(Uuid, Option<Product>),
    Hold(Uuid, Option<Hold>),
    HoldToken(String, Option<Uuid>),
    Order(Uuid, Option<Order>),
    OrderByHold(Uuid, Option<Uuid>),
    Idempotency(String, Option<IdempotencyRecord>),
}

fn restore<K: Hash + Eq, V>(table: &mut HashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            table.insert(key, value);
        }
        None => {
            table.remove(&key);
        }
    }
}

impl Tables {
    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Product(id, previous) => restore(&mut self.products, id, previous),
            Undo::Hold(id, Some(hold)) => {
                self.holds.insert(id, hold);
            }
            Undo::Hold(id, None) => {
                self.holds.remove(&id);
            }
            Undo::HoldToken(token, previous) => restore(&mut self.hold_tokens, token, previous),
            Undo::Order(id, previous) => restore(&mut self.orders, id, previous),
            Undo::OrderByHold(hold_id, previous) => restore(&mut self.orders_by_hold, hold_id, previous),
            Undo::Idempotency(key, previous) => restore(&mut self.idempotency, key, previous),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            lock_timeout,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let tables = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.tables).lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(self.lock_timeout))?;
        Ok(MemoryTransaction {
            tables,
            undo: Vec::new(),
        })
    }
}

pub struct MemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
}

impl MemoryTransaction {
    fn revert(&mut self) {
        while let Some(undo) = self.undo.pop() {
            self.tables.revert(undo);
        }
    }

    fn product_mut(&mut self, id: Uuid) -> Option<&mut Product> {
        let previous = self.tables.products.get(&id)?.clone();
        self.undo.push(Undo::Product(id, Some(previous)));
        self.tables.products.get_mut(&id)
    }

    fn hold_mut(&mut self, id: Uuid) -> Option<&mut Hold> {
        let previous = self.tables.holds.get(&id)?.clone();
        self.undo.push(Undo::Hold(id, Some(previous)));
        self.tables.holds.get_mut(&id)
    }

    fn order_mut(&mut self, id: Uuid) -> Option<&mut Order> {
        let previous = self.tables.orders.get(&id)?.clone();
        self.undo.push(Undo::Order(id, Some(previous)));
        self.tables.orders.get_mut(&id)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.revert();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.undo.clear();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.revert();
        Ok(())
    }
}

#[async_trait]
impl StockLedger for MemoryTransaction {
    async fn reserve_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError> {
        let Some(product) = self.product_mut(product_id) else {
            return Ok(false);
        };
        if quantity <= 0 || product.stock - product.reserved < quantity {
            return Ok(false);
        }
        product.reserved += quantity;
        Ok(true)
    }

    async fn release_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError> {
        let Some(product) = self.product_mut(product_id) else {
            return Ok(false);
        };
        if quantity <= 0 || product.reserved < quantity {
            return Ok(false);
        }
        product.reserved -= quantity;
        Ok(true)
    }

    async fn commit_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError> {
        let Some(product) = self.product_mut(product_id) else {
            return Ok(false);
        };
        if quantity <= 0 || product.reserved < quantity {
            return Ok(false);
        }
        product.stock -= quantity;
        product.reserved -= quantity;
        Ok(true)
    }
}

#[async_trait]
impl ProductRepository for MemoryTransaction {
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
        let previous = self.tables.products.insert(product.id, product.clone());
        self.undo.push(Undo::Product(product.id, previous));
        Ok(product)
    }

    async fn find_product(&mut self, id: Uuid) -> Result<Option<Product>, StoreError> {
        Ok(self.tables.products.get(&id).cloned())
    }

    async fn lock_product(&mut self, id: Uuid) -> Result<Option<Product>, StoreError> {
        self.find_product(id).await
    }
}

#[async_trait]
impl HoldRepository for MemoryTransaction {
    async fn insert_hold(&mut self, hold: &Hold) -> Result<(), StoreError> {
        if self.tables.hold_tokens.contains_key(&hold.token) || self.tables.holds.contains_key(&hold.id) {
            return Err(StoreError::UniqueViolation(format!("hold token {}", hold.token)));
        }
        self.tables.hold_tokens.insert(hold.token.clone(), hold.id);
        self.undo.push(Undo::HoldToken(hold.token.clone(), None));
        self.tables.holds.insert(hold.id, hold.clone());
        self.undo.push(Undo::Hold(hold.id, None));
        Ok(())
    }

    async fn lock_hold(&mut self, id: Uuid) -> Result<Option<Hold>, StoreError> {
        Ok(self.tables.holds.get(&id).cloned())
    }

    async fn lock_hold_by_token(&mut self, token: &str) -> Result<Option<Hold>, StoreError> {
        self.find_hold_by_token(token).await
    }

    async fn find_hold_by_token(&mut self, token: &str) -> Result<Option<Hold>, StoreError> {
        let tables = &self.tables;
        Ok(tables
            .hold_tokens
            .get(token)
            .and_then(|id| tables.holds.get(id))
            .cloned())
    }

    async fn mark_hold_used(&mut self, id: Uuid) -> Result<(), StoreError> {
        if let Some(hold) = self.hold_mut(id) {
            hold.used = true;
        }
        Ok(())
    }

    async fn expired_hold_ids(
        &mut self,
        now: DateTime<Utc>,
        after: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .tables
            .holds
            .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            .filter(|(_, hold)| !hold.used && hold.expires_at <= now)
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl OrderRepository for MemoryTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        if self.tables.orders_by_hold.contains_key(&order.hold_id) {
            return Err(StoreError::UniqueViolation(format!("order for hold {}", order.hold_id)));
        }
        self.tables.orders_by_hold.insert(order.hold_id, order.id);
        self.undo.push(Undo::OrderByHold(order.hold_id, None));
        let previous = self.tables.orders.insert(order.id, order.clone());
        self.undo.push(Undo::Order(order.id, previous));
        Ok(())
    }

    async fn find_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.tables.orders.get(&id).cloned())
    }

    async fn lock_order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        self.find_order(id).await
    }

    async fn lock_order_by_hold_token(&mut self, token: &str) -> Result<Option<Order>, StoreError> {
        let tables = &self.tables;
        Ok(tables
            .hold_tokens
            .get(token)
            .and_then(|hold_id| tables.orders_by_hold.get(hold_id))
            .and_then(|order_id| tables.orders.get(order_id))
            .cloned())
    }

    async fn set_order_status(
        &mut self,
        id: Uuid,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(order) = self.order_mut(id) {
            order.status = status;
            order.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryTransaction {
    async fn find_idempotency(&mut self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.tables.idempotency.get(key).cloned())
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        if self.tables.idempotency.contains_key(&record.key) {
            return Err(StoreError::UniqueViolation(format!("idempotency key {}", record.key)));
        }
        self.tables.idempotency.insert(record.key.clone(), record.clone());
        self.undo.push(Undo::Idempotency(record.key.clone(), None));
        Ok(())
    }

    async fn purge_idempotency(&mut self, expired_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired: Vec<String> = self
            .tables
            .idempotency
            .values()
            .filter(|record| record.expires_at <= expired_before)
            .map(|record| record.key.clone())
            .collect();

        for key in &expired {
            if let Some(record) = self.tables.idempotency.remove(key) {
                self.undo.push(Undo::Idempotency(key.clone(), Some(record)));
            }
        }
        Ok(expired.len() as u64)
    }
}
