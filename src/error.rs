use thiserror::Error;

/// Failure talking to the ledger, token registry or identity tables.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store lock poisoned")]
    Poisoned,
}

/// A single-use token was already consumed by another transaction.
#[derive(Debug, Error)]
#[error("token {token_id} already consumed by {owner}")]
pub struct ConflictError {
    pub token_id: String,
    pub owner: String,
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    Missing(&'static str),
    #[error("amount must be positive and finite, got {0}")]
    Amount(f64),
    #[error("window_hours must be within 1..={max}, got {got}")]
    Window { got: u64, max: u64 },
}

/// Top-level error surfaced by the reconciliation pipeline and detectors.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("invalid transaction: {0}")]
    Validation(#[from] ValidationError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl IntegrityError {
    /// Storage hiccups are safe to retry because reconciliation is idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IntegrityError::Storage(_) | IntegrityError::Worker(_))
    }
}
