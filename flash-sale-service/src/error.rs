use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("lock not acquired within {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors worth retrying the whole transaction for. A uniqueness
    /// violation counts because two writers racing on the same idempotency
    /// key resolve by the loser retrying and replaying the winner's record.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_) | StoreError::LockTimeout(_) | StoreError::UniqueViolation(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Reserve,
    Release,
    Commit,
}

impl std::fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LedgerOp::Reserve => "reserve",
            LedgerOp::Release => "release",
            LedgerOp::Commit => "commit",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ledger {op} of {quantity} unit(s) failed for product {product_id}")]
    LedgerInvariantViolation {
        op: LedgerOp,
        product_id: Uuid,
        quantity: i32,
    },

    #[error("gave up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("failed to encode response: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(err) if err.is_transient())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
