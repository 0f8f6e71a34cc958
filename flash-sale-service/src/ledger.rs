//! Stock accounting primitives.
//!
//! `stock` and `reserved` on a product row are only ever changed through the
//! three conditional writes below. Each one checks its precondition and
//! applies its change in a single statement, so two writers can never both
//! observe the same `reserved` value and oversell. A `false` result means
//! the precondition did not hold and nothing was written.

use async_trait::async_trait;
use tracing::error;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, LedgerOp, StoreError};

#[async_trait]
pub trait StockLedger: Send {
    /// `reserved += qty` iff `stock - reserved >= qty`.
    async fn reserve_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError>;

    /// `reserved -= qty` iff `reserved >= qty`.
    async fn release_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError>;

    /// `stock -= qty; reserved -= qty` iff `reserved >= qty`.
    async fn commit_stock(&mut self, product_id: Uuid, quantity: i32) -> Result<bool, StoreError>;
}

/// Runs a ledger operation whose precondition must hold because the caller
/// already accounted for the units (a hold or a pending order). A refusal
/// here means `reserved` drifted and is reported as an invariant violation.
pub async fn require<L>(ledger: &mut L, op: LedgerOp, product_id: Uuid, quantity: i32) -> EngineResult<()>
where
    L: StockLedger + ?Sized,
{
    let applied = match op {
        LedgerOp::Reserve => ledger.reserve_stock(product_id, quantity).await?,
        LedgerOp::Release => ledger.release_stock(product_id, quantity).await?,
        LedgerOp::Commit => ledger.commit_stock(product_id, quantity).await?,
    };

    if applied {
        Ok(())
    } else {
        error!(%product_id, quantity, %op, "stock ledger refused an accounted operation");
        Err(EngineError::LedgerInvariantViolation {
            op,
            product_id,
            quantity,
        })
    }
}
