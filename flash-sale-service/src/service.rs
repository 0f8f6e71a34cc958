use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use shared::{Hold, HoldOutcome, NewProduct, Order, OrderOutcome, Product, ProductView, SettlementPayload, SettlementResponse};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::holds::HoldManager;
use crate::idempotency::IdempotencyStore;
use crate::orders::OrderManager;
use crate::retry::{in_transaction, RetryPolicy};
use crate::settlement::SettlementProcessor;
use crate::store::{Store, Transaction};

/// Single entry point wiring the engine components to one store and clock.
pub struct FlashSaleService<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    gate: IdempotencyStore,
    holds: HoldManager<S>,
    orders: OrderManager<S>,
    settlements: SettlementProcessor<S>,
    settings: Settings,
}

impl<S: Store> FlashSaleService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: Settings) -> Self {
        Self {
            holds: HoldManager::new(Arc::clone(&store), Arc::clone(&clock), &settings),
            orders: OrderManager::new(Arc::clone(&store), Arc::clone(&clock), &settings),
            settlements: SettlementProcessor::new(Arc::clone(&store), Arc::clone(&clock), &settings),
            retry: RetryPolicy::from_settings(&settings),
            gate: IdempotencyStore::new(&settings),
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn create_product(&self, product: NewProduct) -> EngineResult<Product> {
        if product.name.trim().is_empty() {
            return Err(EngineError::Validation("product name is required".to_string()));
        }
        if product.price < BigDecimal::from(0) {
            return Err(EngineError::Validation(format!("price must not be negative, got {}", product.price)));
        }
        if product.stock < 0 {
            return Err(EngineError::Validation(format!("stock must not be negative, got {}", product.stock)));
        }

        let now = self.clock.now();
        let product = in_transaction(self.store.as_ref(), self.retry, "create_product", |tx| {
            Box::pin(insert_product(tx, product.clone(), now))
        })
        .await?;

        info!(product_id = %product.id, name = %product.name, stock = product.stock, "Product created");
        Ok(product)
    }

    pub async fn product(&self, product_id: Uuid) -> EngineResult<Option<ProductView>> {
        let product = in_transaction(self.store.as_ref(), self.retry, "find_product", |tx| {
            Box::pin(find_product(tx, product_id))
        })
        .await?;
        Ok(product.map(|p| p.view()))
    }

    pub async fn create_hold(&self, product_id: Uuid, quantity: i32) -> EngineResult<HoldOutcome> {
        self.holds.create_hold(product_id, quantity).await
    }

    pub async fn create_order(&self, hold_token: &str) -> EngineResult<OrderOutcome> {
        self.orders.create_order(hold_token).await
    }

    pub async fn handle_settlement(
        &self,
        payload: SettlementPayload,
        idempotency_key: &str,
    ) -> EngineResult<SettlementResponse> {
        self.settlements.handle_settlement(payload, idempotency_key).await
    }

    pub async fn release_expired_holds(&self) -> EngineResult<u64> {
        self.holds.release_expired_holds().await
    }

    pub async fn purge_expired_idempotency_records(&self) -> EngineResult<u64> {
        let gate = self.gate;
        let now = self.clock.now();
        let purged = in_transaction(self.store.as_ref(), self.retry, "purge_idempotency", |tx| {
            Box::pin(purge_idempotency(tx, gate, now))
        })
        .await?;

        if purged > 0 {
            info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }

    pub async fn order(&self, order_id: Uuid) -> EngineResult<Option<Order>> {
        in_transaction(self.store.as_ref(), self.retry, "find_order", |tx| {
            Box::pin(find_order(tx, order_id))
        })
        .await
    }

    pub async fn hold_by_token(&self, token: &str) -> EngineResult<Option<Hold>> {
        in_transaction(self.store.as_ref(), self.retry, "find_hold", |tx| {
            Box::pin(find_hold(tx, token.to_string()))
        })
        .await
    }
}

async fn insert_product<T: Transaction>(
    tx: &mut T,
    product: NewProduct,
    now: DateTime<Utc>,
) -> EngineResult<Product> {
    Ok(tx.insert_product(product, now).await?)
}

async fn find_product<T: Transaction>(tx: &mut T, product_id: Uuid) -> EngineResult<Option<Product>> {
    Ok(tx.find_product(product_id).await?)
}

async fn find_order<T: Transaction>(tx: &mut T, order_id: Uuid) -> EngineResult<Option<Order>> {
    Ok(tx.find_order(order_id).await?)
}

async fn find_hold<T: Transaction>(tx: &mut T, token: String) -> EngineResult<Option<Hold>> {
    Ok(tx.find_hold_by_token(&token).await?)
}

async fn purge_idempotency<T: Transaction>(
    tx: &mut T,
    gate: IdempotencyStore,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    gate.purge_expired(tx, now).await
}
