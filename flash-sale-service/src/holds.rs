//! Hold lifecycle: creation against a stock reservation, and reclamation of
//! holds that expired without being turned into an order.

use chrono::{DateTime, Duration, Utc};
use shared::{Hold, HoldOutcome};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{EngineError, EngineResult, LedgerOp};
use crate::ledger;
use crate::retry::{in_transaction, RetryPolicy};
use crate::store::{Store, Transaction};

pub struct HoldManager<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    ttl: Duration,
    max_quantity: i32,
    batch_size: i64,
}

impl<S: Store> HoldManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: &Settings) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::from_settings(settings),
            ttl: settings.hold_ttl(),
            max_quantity: settings.max_hold_quantity,
            batch_size: settings.sweep_batch_size.max(1),
        }
    }

    pub async fn create_hold(&self, product_id: Uuid, quantity: i32) -> EngineResult<HoldOutcome> {
        if quantity < 1 || quantity > self.max_quantity {
            return Err(EngineError::Validation(format!(
                "quantity must be between 1 and {}, got {}",
                self.max_quantity, quantity
            )));
        }

        let ttl = self.ttl;
        let outcome = in_transaction(self.store.as_ref(), self.retry, "create_hold", |tx| {
            Box::pin(reserve_hold(tx, product_id, quantity, self.clock.now(), ttl))
        })
        .await?;

        match &outcome {
            HoldOutcome::Created(hold) => {
                info!(hold_id = %hold.id, %product_id, quantity, expires_at = %hold.expires_at, "Hold created");
            }
            HoldOutcome::InsufficientStock { available, .. } => {
                warn!(%product_id, quantity, available, "Hold rejected: insufficient stock");
            }
            HoldOutcome::ProductNotFound => {
                warn!(%product_id, quantity, "Hold rejected: unknown product");
            }
        }

        Ok(outcome)
    }

    /// Returns the reserved units of every expired, unused hold to the pool
    /// and marks those holds used. Each hold is reclaimed in its own
    /// transaction after re-checking it under lock, so a hold consumed by a
    /// concurrent order is left alone and repeated sweeps reclaim nothing
    /// twice.
    pub async fn release_expired_holds(&self) -> EngineResult<u64> {
        let now = self.clock.now();
        let batch_size = self.batch_size;
        let mut cursor = Uuid::nil();
        let mut released = 0;

        loop {
            let batch = in_transaction(self.store.as_ref(), self.retry, "scan_expired_holds", |tx| {
                Box::pin(scan_expired(tx, now, cursor, batch_size))
            })
            .await?;

            for hold_id in &batch {
                let hold_id = *hold_id;
                let reclaimed = in_transaction(self.store.as_ref(), self.retry, "reclaim_hold", |tx| {
                    Box::pin(reclaim_hold(tx, hold_id, now))
                })
                .await;

                match reclaimed {
                    Ok(true) => released += 1,
                    Ok(false) => {}
                    Err(e @ EngineError::LedgerInvariantViolation { .. }) => {
                        error!(%hold_id, error = %e, "Expired hold could not be released");
                    }
                    Err(e) => return Err(e),
                }
            }

            match batch.last() {
                Some(last) if batch.len() as i64 == batch_size => cursor = *last,
                _ => break,
            }
        }

        if released > 0 {
            info!(released, "Released expired holds");
        }
        Ok(released)
    }
}

async fn reserve_hold<T: Transaction>(
    tx: &mut T,
    product_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
    ttl: Duration,
) -> EngineResult<HoldOutcome> {
    let Some(product) = tx.lock_product(product_id).await? else {
        return Ok(HoldOutcome::ProductNotFound);
    };

    if !tx.reserve_stock(product_id, quantity).await? {
        return Ok(HoldOutcome::InsufficientStock {
            requested: quantity,
            available: product.available(),
        });
    }

    let hold = Hold::new(product_id, quantity, now, ttl);
    tx.insert_hold(&hold).await?;
    Ok(HoldOutcome::Created(hold))
}

async fn scan_expired<T: Transaction>(tx: &mut T, now: DateTime<Utc>, after: Uuid, limit: i64) -> EngineResult<Vec<Uuid>> {
    Ok(tx.expired_hold_ids(now, after, limit).await?)
}

async fn reclaim_hold<T: Transaction>(tx: &mut T, hold_id: Uuid, now: DateTime<Utc>) -> EngineResult<bool> {
    let Some(hold) = tx.lock_hold(hold_id).await? else {
        return Ok(false);
    };
    // Lost the race: the hold became an order, or another sweep got here first.
    if hold.used || !hold.is_expired(now) {
        return Ok(false);
    }

    ledger::require(tx, LedgerOp::Release, hold.product_id, hold.quantity).await?;
    tx.mark_hold_used(hold.id).await?;

    info!(hold_id = %hold.id, product_id = %hold.product_id, quantity = hold.quantity, "Expired hold released");
    Ok(true)
}
