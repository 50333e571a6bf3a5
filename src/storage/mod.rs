//! Collaborator seams: the ledger store, the token registry and the identity
//! layer. `SqliteLedger` implements all three over one database.

use chrono::{DateTime, Utc};

use crate::error::{RegisterError, StoreError};
use crate::model::{Classification, LedgerEntry, UsedToken};

mod sqlite;

pub use sqlite::{AuditSnapshot, SqliteLedger};

#[derive(Debug, Clone, PartialEq)]
pub struct PairAggregate {
    pub sender_id: String,
    pub receiver_id: String,
    pub count: u64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SenderAggregate {
    pub sender_id: String,
    pub count: u64,
    pub total: f64,
}

/// Result of an atomic "register token + insert entry" attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// First persist of this transaction id. `trust_change` is the sender's
    /// `(before, after)` score when feedback was applied in the same commit.
    Inserted {
        entry: LedgerEntry,
        trust_change: Option<(f64, f64)>,
    },
    /// Another submission got there first; this is the authoritative entry.
    Existing(LedgerEntry),
    /// The token was consumed by `owner` between scoring and commit. Nothing
    /// was written.
    TokenTaken { owner: String },
}

impl InsertOutcome {
    pub fn was_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }
}

pub trait LedgerStore: Send + Sync {
    fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<LedgerEntry>, StoreError>;

    /// Insert `entry` unless its transaction id already exists. When `token`
    /// is given it is registered in the same unit of work, and so is
    /// `sender_trust`, applied to the sender's score if the sender is known.
    /// Nothing is written unless the entry itself is.
    fn insert_if_absent(
        &self,
        entry: &LedgerEntry,
        token: Option<&UsedToken>,
        sender_trust: Option<&dyn Fn(f64) -> f64>,
    ) -> Result<InsertOutcome, StoreError>;

    fn count_and_sum_by_sender_receiver(&self, since: DateTime<Utc>) -> Result<Vec<PairAggregate>, StoreError>;

    fn count_and_sum_by_sender(&self, since: DateTime<Utc>) -> Result<Vec<SenderAggregate>, StoreError>;

    /// Transactions sent by `sender` with `from <= timestamp <= to`.
    fn count_in_window(&self, sender: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, StoreError>;

    fn sum_in_window(&self, sender: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError>;

    /// Whether `b` sent anything to `a` with `from <= timestamp <= to`.
    fn exists_reverse_edge(&self, a: &str, b: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Distinct (sender, receiver) pairs at or after `since`, sorted.
    fn distinct_edges(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>, StoreError>;

    fn classifications_for_sender(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Classification>, StoreError>;

    /// Most recent entries where `user` is sender or receiver.
    fn entries_for_user(&self, user: &str, limit: usize) -> Result<Vec<LedgerEntry>, StoreError>;
}

pub trait TokenRegistry: Send + Sync {
    fn is_used(&self, token_id: &str) -> Result<bool, StoreError>;

    fn owner_of(&self, token_id: &str) -> Result<Option<UsedToken>, StoreError>;

    /// Fails with a conflict if the token is already registered.
    fn register(&self, token: &UsedToken) -> Result<(), RegisterError>;
}

/// Identity/session layer as seen by the engine.
pub trait Identity: Send + Sync {
    fn public_key(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    fn trust_score(&self, user_id: &str) -> Result<Option<f64>, StoreError>;

    /// Atomically replace a user's trust score with `update(current)`.
    /// Returns `(before, after)`, or `None` for unknown users.
    fn update_trust(
        &self,
        user_id: &str,
        update: &dyn Fn(f64) -> f64,
    ) -> Result<Option<(f64, f64)>, StoreError>;
}
