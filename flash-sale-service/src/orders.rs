use chrono::{DateTime, Utc};
use shared::{Order, OrderOutcome};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::retry::{in_transaction, RetryPolicy};
use crate::store::{Store, Transaction};

/// Turns a live hold into a pending order. Competes with the expiry sweep
/// for the hold row lock; whichever takes it first decides the hold's fate.
pub struct OrderManager<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S: Store> OrderManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: &Settings) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::from_settings(settings),
        }
    }

    pub async fn create_order(&self, hold_token: &str) -> EngineResult<OrderOutcome> {
        if hold_token.trim().is_empty() {
            return Err(EngineError::Validation("hold token is required".to_string()));
        }

        let outcome = in_transaction(self.store.as_ref(), self.retry, "create_order", |tx| {
            Box::pin(consume_hold(tx, hold_token.to_string(), self.clock.now()))
        })
        .await?;

        match &outcome {
            OrderOutcome::Created(order) => {
                info!(order_id = %order.id, hold_id = %order.hold_id, product_id = %order.product_id, "Order created");
            }
            OrderOutcome::InvalidHold => {
                warn!(hold_token, "Order rejected: invalid or expired hold");
            }
        }

        Ok(outcome)
    }
}

async fn consume_hold<T: Transaction>(tx: &mut T, hold_token: String, now: DateTime<Utc>) -> EngineResult<OrderOutcome> {
    let hold = match tx.lock_hold_by_token(&hold_token).await? {
        Some(hold) if hold.is_valid(now) => hold,
        _ => return Ok(OrderOutcome::InvalidHold),
    };

    let product = tx
        .find_product(hold.product_id)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("hold {} references missing product {}", hold.id, hold.product_id)))?;

    tx.mark_hold_used(hold.id).await?;
    let order = Order::pending(&hold, &product.price, now);
    tx.insert_order(&order).await?;

    Ok(OrderOutcome::Created(order))
}
