//! Applies payment outcomes reported by the gateway to pending orders.
//!
//! Notifications may arrive twice, late, or before the order they refer to
//! exists. Every notification runs behind the idempotency gate, and the
//! ledger change, the order status change and the idempotency record commit
//! together or not at all.

use chrono::{DateTime, Utc};
use shared::{Order, OrderStatus, PaymentStatus, SettlementBody, SettlementPayload, SettlementResponse};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{EngineError, EngineResult, LedgerOp, StoreError};
use crate::idempotency::{self, IdempotencyStore};
use crate::ledger;
use crate::retry::{in_transaction, RetryPolicy};
use crate::store::{OrderRepository, Store, Transaction};

pub struct SettlementProcessor<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    gate: IdempotencyStore,
}

impl<S: Store> SettlementProcessor<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: &Settings) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::from_settings(settings),
            gate: IdempotencyStore::new(settings),
        }
    }

    pub async fn handle_settlement(
        &self,
        payload: SettlementPayload,
        idempotency_key: &str,
    ) -> EngineResult<SettlementResponse> {
        if idempotency_key.is_empty() {
            return Err(EngineError::Validation("idempotency key is required".to_string()));
        }

        let fingerprint = idempotency::fingerprint(&payload)?;
        let gate = self.gate;

        let result = in_transaction(self.store.as_ref(), self.retry, "handle_settlement", |tx| {
            Box::pin(settle_once(
                tx,
                gate,
                idempotency_key.to_string(),
                fingerprint.clone(),
                payload.clone(),
                self.clock.now(),
            ))
        })
        .await;

        match &result {
            Ok(response) => {
                info!(idempotency_key, status = response.status_code, "Payment webhook processed");
            }
            Err(e) => {
                error!(idempotency_key, error = %e, "Webhook processing failed");
            }
        }
        result
    }
}

async fn settle_once<T: Transaction + 'static>(
    tx: &mut T,
    gate: IdempotencyStore,
    key: String,
    fingerprint: String,
    payload: SettlementPayload,
    now: DateTime<Utc>,
) -> EngineResult<SettlementResponse> {
    gate.process_once(tx, &key, &fingerprint, now, move |tx| Box::pin(settle(tx, payload, now)))
        .await
}

async fn settle<T: Transaction>(
    tx: &mut T,
    payload: SettlementPayload,
    now: DateTime<Utc>,
) -> EngineResult<SettlementResponse> {
    match resolve_order(tx, &payload).await? {
        Some(order) => apply(tx, order, &payload, now).await,
        None => {
            warn!(order_id = ?payload.order_id, hold_token = ?payload.hold_token, "Order not found for webhook");
            Ok(SettlementResponse::new(SettlementResponse::ACCEPTED, &SettlementBody::accepted())?)
        }
    }
}

/// Finds and locks the order a notification refers to: by explicit order id
/// when one is given, otherwise through the hold token. `None` is a normal
/// outcome when the notification overtook order creation.
pub async fn resolve_order<T>(tx: &mut T, payload: &SettlementPayload) -> Result<Option<Order>, StoreError>
where
    T: OrderRepository + ?Sized,
{
    match (payload.order_id, payload.hold_token.as_deref()) {
        (Some(order_id), _) => tx.lock_order(order_id).await,
        (None, Some(token)) => tx.lock_order_by_hold_token(token).await,
        (None, None) => Ok(None),
    }
}

/// Applies one payment outcome to a locked order. Orders that already left
/// `pending` are reported with their current status and left untouched.
pub async fn apply<T: Transaction>(
    tx: &mut T,
    order: Order,
    payload: &SettlementPayload,
    now: DateTime<Utc>,
) -> EngineResult<SettlementResponse> {
    if order.status.is_terminal() {
        info!(order_id = %order.id, status = %order.status, "Order already processed");
        let body = SettlementBody::for_order("Order already processed", &order);
        return Ok(SettlementResponse::new(SettlementResponse::SETTLED, &body)?);
    }

    match payload.status {
        PaymentStatus::Success => {
            ledger::require(tx, LedgerOp::Commit, order.product_id, order.quantity).await?;
            tx.set_order_status(order.id, OrderStatus::Paid, now).await?;
            let order = Order {
                status: OrderStatus::Paid,
                updated_at: now,
                ..order
            };

            info!(order_id = %order.id, amount = %order.total_amount, "Payment successful");
            let body = SettlementBody::for_order("Payment processed successfully", &order);
            Ok(SettlementResponse::new(SettlementResponse::SETTLED, &body)?)
        }
        PaymentStatus::Failed => {
            ledger::require(tx, LedgerOp::Release, order.product_id, order.quantity).await?;
            tx.set_order_status(order.id, OrderStatus::Cancelled, now).await?;
            if let Some(hold) = tx.lock_hold(order.hold_id).await? {
                if !hold.used {
                    tx.mark_hold_used(hold.id).await?;
                }
            }
            let order = Order {
                status: OrderStatus::Cancelled,
                updated_at: now,
                ..order
            };

            warn!(
                order_id = %order.id,
                reason = payload.failure_reason.as_deref().unwrap_or("unknown"),
                "Payment failed"
            );
            let body = SettlementBody::for_order("Payment failed, order cancelled", &order);
            Ok(SettlementResponse::new(SettlementResponse::FAILED, &body)?)
        }
    }
}
