//! Per-transaction reconciliation: lookup, score, token bookkeeping,
//! categorize, persist, trust feedback.

use serde::Serialize;

use crate::model::ReconciliationResult;

mod pipeline;

pub use pipeline::Reconciler;

/// Outcome for one candidate of a submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Reconciled(ReconciliationResult),
    Rejected {
        transaction_id: String,
        reason: String,
    },
    Failed {
        transaction_id: String,
        error: String,
        retryable: bool,
    },
}

impl SyncOutcome {
    pub fn transaction_id(&self) -> &str {
        match self {
            SyncOutcome::Reconciled(r) => &r.transaction_id,
            SyncOutcome::Rejected { transaction_id, .. } | SyncOutcome::Failed { transaction_id, .. } => {
                transaction_id
            }
        }
    }

    pub fn result(&self) -> Option<&ReconciliationResult> {
        match self {
            SyncOutcome::Reconciled(r) => Some(r),
            _ => None,
        }
    }
}
