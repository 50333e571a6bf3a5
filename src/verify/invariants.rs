//! Offline ledger audit: the properties every committed ledger must hold no
//! matter how submissions interleaved.

use serde::Serialize;

use crate::error::StoreError;
use crate::storage::{AuditSnapshot, SqliteLedger};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub entries: u64,
    pub tokens: u64,
    pub violations: Vec<InvariantViolation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

fn violations<'a>(invariant: &'static str, subjects: &'a [String]) -> impl Iterator<Item = InvariantViolation> + 'a {
    subjects.iter().map(move |s| InvariantViolation {
        invariant,
        subject: s.clone(),
    })
}

/// Every entry's score lies in [0, 1]; every token row points at an entry;
/// each first-time entry owns its token; a duplicate never owns one.
pub fn check_ledger(snapshot: &AuditSnapshot) -> AuditReport {
    let violations = violations("score_out_of_range", &snapshot.scores_out_of_range)
        .chain(violations("orphan_token", &snapshot.orphan_tokens))
        .chain(violations("token_not_registered", &snapshot.unregistered_tokens))
        .chain(violations("duplicate_owns_token", &snapshot.duplicates_owning_token))
        .collect();
    AuditReport {
        entries: snapshot.entries,
        tokens: snapshot.tokens,
        violations,
    }
}

pub fn audit(store: &SqliteLedger) -> Result<AuditReport, StoreError> {
    Ok(check_ledger(&store.audit_snapshot()?))
}
