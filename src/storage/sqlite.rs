use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use super::{Identity, InsertOutcome, LedgerStore, PairAggregate, SenderAggregate, TokenRegistry};
use crate::error::{ConflictError, RegisterError, StoreError};
use crate::model::{CandidateTransaction, Category, Classification, LedgerEntry, RiskFlag, UsedToken};

const SCHEMA: &str = "BEGIN;
    CREATE TABLE IF NOT EXISTS ledger (
        transaction_id TEXT PRIMARY KEY,
        sender_id TEXT NOT NULL,
        receiver_id TEXT NOT NULL,
        merchant_id TEXT,
        invoice_id TEXT,
        amount REAL NOT NULL,
        ts_ms INTEGER NOT NULL,
        token_id TEXT NOT NULL,
        signature TEXT NOT NULL,
        propagated_to_peers INTEGER NOT NULL,
        risk_score REAL NOT NULL,
        classification TEXT NOT NULL,
        risk_flags TEXT NOT NULL,
        category TEXT NOT NULL,
        fingerprint TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS ledger_sender_ts ON ledger (sender_id, ts_ms);
    CREATE INDEX IF NOT EXISTS ledger_ts ON ledger (ts_ms);
    CREATE TABLE IF NOT EXISTS used_tokens (
        token_id TEXT PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        consumed_ms INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        public_key TEXT,
        trust_score REAL NOT NULL DEFAULT 1.0
    );
    COMMIT;";

const ENTRY_COLUMNS: &str = "transaction_id, sender_id, receiver_id, merchant_id, invoice_id, \
     amount, ts_ms, token_id, signature, propagated_to_peers, risk_score, classification, \
     risk_flags, category, fingerprint";

/// Counts used by the offline ledger audit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditSnapshot {
    pub entries: u64,
    pub tokens: u64,
    pub scores_out_of_range: Vec<String>,
    pub orphan_tokens: Vec<String>,
    pub unregistered_tokens: Vec<String>,
    pub duplicates_owning_token: Vec<String>,
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

struct RawEntry {
    transaction_id: String,
    sender_id: String,
    receiver_id: String,
    merchant_id: Option<String>,
    invoice_id: Option<String>,
    amount: f64,
    ts_ms: i64,
    token_id: String,
    signature: String,
    propagated_to_peers: i64,
    risk_score: f64,
    classification: String,
    risk_flags: String,
    category: String,
    fingerprint: String,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            transaction_id: row.get(0)?,
            sender_id: row.get(1)?,
            receiver_id: row.get(2)?,
            merchant_id: row.get(3)?,
            invoice_id: row.get(4)?,
            amount: row.get(5)?,
            ts_ms: row.get(6)?,
            token_id: row.get(7)?,
            signature: row.get(8)?,
            propagated_to_peers: row.get(9)?,
            risk_score: row.get(10)?,
            classification: row.get(11)?,
            risk_flags: row.get(12)?,
            category: row.get(13)?,
            fingerprint: row.get(14)?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry, StoreError> {
        let key = self.transaction_id.clone();
        let timestamp = from_ms(self.ts_ms).ok_or_else(|| corrupt(&key, "timestamp out of range"))?;
        let classification: Classification = self.classification.parse().map_err(|e| corrupt(&key, e))?;
        let category: Category = self.category.parse().map_err(|e| corrupt(&key, e))?;
        let risk_flags: Vec<RiskFlag> =
            serde_json::from_str(&self.risk_flags).map_err(|e| corrupt(&key, e))?;
        Ok(LedgerEntry {
            candidate: CandidateTransaction {
                transaction_id: self.transaction_id,
                sender_id: self.sender_id,
                receiver_id: self.receiver_id,
                merchant_id: self.merchant_id,
                invoice_id: self.invoice_id,
                amount: self.amount,
                timestamp,
                token_id: self.token_id,
                signature: self.signature,
                propagated_to_peers: u32::try_from(self.propagated_to_peers)
                    .map_err(|e| corrupt(&key, e))?,
                synced: true,
            },
            risk_score: self.risk_score,
            classification,
            risk_flags,
            category,
            fingerprint: self.fingerprint,
        })
    }
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn select_entry(conn: &Connection, transaction_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
    let sql = format!("SELECT {} FROM ledger WHERE transaction_id = ?1", ENTRY_COLUMNS);
    let raw = conn
        .query_row(&sql, params![transaction_id], RawEntry::from_row)
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

fn select_token(conn: &Connection, token_id: &str) -> Result<Option<UsedToken>, StoreError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT transaction_id, consumed_ms FROM used_tokens WHERE token_id = ?1",
            params![token_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    row.map(|(transaction_id, ms)| {
        Ok(UsedToken {
            token_id: token_id.to_string(),
            transaction_id,
            consumed_at: from_ms(ms).ok_or_else(|| corrupt(token_id, "consumed_ms out of range"))?,
        })
    })
    .transpose()
}

fn insert_token(conn: &Connection, token: &UsedToken) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO used_tokens (token_id, transaction_id, consumed_ms) VALUES (?1, ?2, ?3)",
        params![token.token_id, token.transaction_id, token.consumed_at.timestamp_millis()],
    )
}

/// Read-modify-write of one user's score on an open connection or transaction.
fn adjust_trust(
    conn: &Connection,
    user_id: &str,
    update: &dyn Fn(f64) -> f64,
) -> Result<Option<(f64, f64)>, StoreError> {
    let current: Option<f64> = conn
        .query_row(
            "SELECT trust_score FROM users WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(before) = current else {
        return Ok(None);
    };
    let after = update(before);
    conn.execute(
        "UPDATE users SET trust_score = ?2 WHERE user_id = ?1",
        params![user_id, after],
    )?;
    Ok(Some((before, after)))
}

fn column_strings(conn: &Connection, sql: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let out = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(out)
}

impl SqliteLedger {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Identity-layer provisioning: create or replace a user record.
    pub fn upsert_user(&self, user_id: &str, public_key: Option<&str>, trust_score: f64) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO users (user_id, public_key, trust_score) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET public_key = excluded.public_key,
                                                trust_score = excluded.trust_score",
            params![user_id, public_key, trust_score],
        )?;
        Ok(())
    }

    pub fn audit_snapshot(&self) -> Result<AuditSnapshot, StoreError> {
        let conn = self.lock()?;
        let entries: i64 = conn.query_row("SELECT COUNT(*) FROM ledger", [], |r| r.get(0))?;
        let tokens: i64 = conn.query_row("SELECT COUNT(*) FROM used_tokens", [], |r| r.get(0))?;
        Ok(AuditSnapshot {
            entries: entries as u64,
            tokens: tokens as u64,
            scores_out_of_range: column_strings(
                &conn,
                "SELECT transaction_id FROM ledger
                 WHERE NOT (risk_score >= 0.0 AND risk_score <= 1.0)
                 ORDER BY transaction_id",
            )?,
            orphan_tokens: column_strings(
                &conn,
                "SELECT u.token_id FROM used_tokens u
                 LEFT JOIN ledger l ON l.transaction_id = u.transaction_id
                 WHERE l.transaction_id IS NULL
                 ORDER BY u.token_id",
            )?,
            unregistered_tokens: column_strings(
                &conn,
                "SELECT l.transaction_id FROM ledger l
                 LEFT JOIN used_tokens u ON u.token_id = l.token_id
                 WHERE l.risk_flags NOT LIKE '%\"DUPLICATE_TOKEN\"%'
                   AND (u.transaction_id IS NULL OR u.transaction_id != l.transaction_id)
                 ORDER BY l.transaction_id",
            )?,
            duplicates_owning_token: column_strings(
                &conn,
                "SELECT l.transaction_id FROM ledger l
                 JOIN used_tokens u ON u.token_id = l.token_id
                 WHERE l.risk_flags LIKE '%\"DUPLICATE_TOKEN\"%'
                   AND u.transaction_id = l.transaction_id
                 ORDER BY l.transaction_id",
            )?,
        })
    }
}

impl LedgerStore for SqliteLedger {
    fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        let conn = self.lock()?;
        select_entry(&conn, transaction_id)
    }

    fn insert_if_absent(
        &self,
        entry: &LedgerEntry,
        token: Option<&UsedToken>,
        sender_trust: Option<&dyn Fn(f64) -> f64>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let c = &entry.candidate;

        if let Some(existing) = select_entry(&tx, &c.transaction_id)? {
            return Ok(InsertOutcome::Existing(existing));
        }

        if let Some(token) = token {
            if let Err(err) = insert_token(&tx, token) {
                if !is_constraint_violation(&err) {
                    return Err(err.into());
                }
                let owner = select_token(&tx, &token.token_id)?
                    .map(|t| t.transaction_id)
                    .unwrap_or_default();
                return Ok(InsertOutcome::TokenTaken { owner });
            }
        }

        let flags = serde_json::to_string(&entry.risk_flags)
            .map_err(|e| corrupt(&c.transaction_id, e))?;
        let sql = format!(
            "INSERT INTO ledger ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(transaction_id) DO NOTHING",
            ENTRY_COLUMNS
        );
        let inserted = tx.execute(
            &sql,
            params![
                c.transaction_id,
                c.sender_id,
                c.receiver_id,
                c.merchant_id,
                c.invoice_id,
                c.amount,
                c.timestamp.timestamp_millis(),
                c.token_id,
                c.signature,
                c.propagated_to_peers as i64,
                entry.risk_score,
                entry.classification.as_str(),
                flags,
                entry.category.as_str(),
                entry.fingerprint,
            ],
        )?;

        if inserted == 0 {
            // Lost the race on the id; rolling back also releases the token row.
            let existing = select_entry(&tx, &c.transaction_id)?
                .ok_or_else(|| corrupt(&c.transaction_id, "conflicting row vanished"))?;
            return Ok(InsertOutcome::Existing(existing));
        }

        let trust_change = match sender_trust {
            Some(update) => adjust_trust(&tx, &c.sender_id, update)?,
            None => None,
        };

        tx.commit()?;
        Ok(InsertOutcome::Inserted {
            entry: LedgerEntry {
                candidate: CandidateTransaction {
                    synced: true,
                    ..entry.candidate.clone()
                },
                ..entry.clone()
            },
            trust_change,
        })
    }

    fn count_and_sum_by_sender_receiver(&self, since: DateTime<Utc>) -> Result<Vec<PairAggregate>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT sender_id, receiver_id, COUNT(*), SUM(amount) FROM ledger
             WHERE ts_ms >= ?1
             GROUP BY sender_id, receiver_id
             ORDER BY sender_id, receiver_id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |r| {
            Ok(PairAggregate {
                sender_id: r.get(0)?,
                receiver_id: r.get(1)?,
                count: r.get::<_, i64>(2)? as u64,
                total: r.get(3)?,
            })
        })?;
        let out = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }

    fn count_and_sum_by_sender(&self, since: DateTime<Utc>) -> Result<Vec<SenderAggregate>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT sender_id, COUNT(*), SUM(amount) FROM ledger
             WHERE ts_ms >= ?1
             GROUP BY sender_id
             ORDER BY sender_id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |r| {
            Ok(SenderAggregate {
                sender_id: r.get(0)?,
                count: r.get::<_, i64>(1)? as u64,
                total: r.get(2)?,
            })
        })?;
        let out = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }

    fn count_in_window(&self, sender: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, StoreError> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM ledger WHERE sender_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3",
            params![sender, from.timestamp_millis(), to.timestamp_millis()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    fn sum_in_window(&self, sender: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError> {
        let total: f64 = self.lock()?.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM ledger
             WHERE sender_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3",
            params![sender, from.timestamp_millis(), to.timestamp_millis()],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    fn exists_reverse_edge(&self, a: &str, b: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<bool, StoreError> {
        let found: i64 = self.lock()?.query_row(
            "SELECT EXISTS (SELECT 1 FROM ledger
                            WHERE sender_id = ?2 AND receiver_id = ?1 AND ts_ms >= ?3 AND ts_ms <= ?4)",
            params![a, b, from.timestamp_millis(), to.timestamp_millis()],
            |r| r.get(0),
        )?;
        Ok(found != 0)
    }

    fn distinct_edges(&self, since: DateTime<Utc>) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT sender_id, receiver_id FROM ledger
             WHERE ts_ms >= ?1
             ORDER BY sender_id, receiver_id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let out = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }

    fn classifications_for_sender(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Classification>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT transaction_id, classification FROM ledger WHERE sender_id = ?1 AND ts_ms >= ?2",
        )?;
        let rows = stmt.query_map(params![sender, since.timestamp_millis()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let raw = rows.collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, c)| c.parse().map_err(|e: String| corrupt(&id, e)))
            .collect()
    }

    fn entries_for_user(&self, user: &str, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM ledger WHERE sender_id = ?1 OR receiver_id = ?1
             ORDER BY ts_ms DESC, transaction_id LIMIT ?2",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user, limit as i64], RawEntry::from_row)?;
        let raw = rows.collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }
}

impl TokenRegistry for SqliteLedger {
    fn is_used(&self, token_id: &str) -> Result<bool, StoreError> {
        let found: i64 = self.lock()?.query_row(
            "SELECT EXISTS (SELECT 1 FROM used_tokens WHERE token_id = ?1)",
            params![token_id],
            |r| r.get(0),
        )?;
        Ok(found != 0)
    }

    fn owner_of(&self, token_id: &str) -> Result<Option<UsedToken>, StoreError> {
        let conn = self.lock()?;
        select_token(&conn, token_id)
    }

    fn register(&self, token: &UsedToken) -> Result<(), RegisterError> {
        let conn = self.lock()?;
        match insert_token(&conn, token) {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => {
                let owner = select_token(&conn, &token.token_id)?
                    .map(|t| t.transaction_id)
                    .unwrap_or_default();
                Err(ConflictError {
                    token_id: token.token_id.clone(),
                    owner,
                }
                .into())
            }
            Err(err) => Err(StoreError::from(err).into()),
        }
    }
}

impl Identity for SqliteLedger {
    fn public_key(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let key: Option<Option<String>> = self
            .lock()?
            .query_row(
                "SELECT public_key FROM users WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(key.flatten().filter(|k| !k.trim().is_empty()))
    }

    fn trust_score(&self, user_id: &str) -> Result<Option<f64>, StoreError> {
        let score = self
            .lock()?
            .query_row(
                "SELECT trust_score FROM users WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(score)
    }

    fn update_trust(
        &self,
        user_id: &str,
        update: &dyn Fn(f64) -> f64,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let change = adjust_trust(&tx, user_id, update)?;
        tx.commit()?;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn entry(id: &str, sender: &str, receiver: &str, amount: f64, secs: i64) -> LedgerEntry {
        LedgerEntry {
            candidate: CandidateTransaction {
                transaction_id: id.to_string(),
                sender_id: sender.to_string(),
                receiver_id: receiver.to_string(),
                merchant_id: None,
                invoice_id: Some("INV-1".to_string()),
                amount,
                timestamp: at(secs),
                token_id: format!("tok-{}", id),
                signature: "simulated_sig_x".to_string(),
                propagated_to_peers: 1,
                synced: false,
            },
            risk_score: 0.1,
            classification: Classification::Valid,
            risk_flags: vec![RiskFlag::SimulatedSignature],
            category: Category::Transfer,
            fingerprint: "fp".to_string(),
        }
    }

    fn token_for(e: &LedgerEntry) -> UsedToken {
        UsedToken {
            token_id: e.candidate.token_id.clone(),
            transaction_id: e.candidate.transaction_id.clone(),
            consumed_at: at(0),
        }
    }

    #[test]
    fn test_insert_then_find_round_trips_entry() {
        let store = SqliteLedger::open_in_memory().unwrap();
        let e = entry("t1", "a", "b", 12.5, 10);
        let outcome = store.insert_if_absent(&e, Some(&token_for(&e)), None).unwrap();
        assert!(outcome.was_new());

        let found = store.find_by_transaction_id("t1").unwrap().unwrap();
        assert_eq!(found.candidate.amount, 12.5);
        assert_eq!(found.risk_flags, vec![RiskFlag::SimulatedSignature]);
        assert_eq!(found.candidate.invoice_id.as_deref(), Some("INV-1"));
        assert!(found.candidate.synced);
        assert!(store.is_used("tok-t1").unwrap());
    }

    #[test]
    fn test_second_insert_returns_existing() {
        let store = SqliteLedger::open_in_memory().unwrap();
        let e = entry("t1", "a", "b", 12.5, 10);
        store.insert_if_absent(&e, Some(&token_for(&e)), None).unwrap();

        let mut again = e.clone();
        again.risk_score = 0.9;
        match store.insert_if_absent(&again, None, None).unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing.risk_score, 0.1),
            other => panic!("expected Existing, got {:?}", other),
        }
    }

    #[test]
    fn test_token_taken_writes_nothing() {
        let store = SqliteLedger::open_in_memory().unwrap();
        let first = entry("t1", "a", "b", 5.0, 0);
        store.insert_if_absent(&first, Some(&token_for(&first)), None).unwrap();

        let mut second = entry("t2", "a", "b", 5.0, 1);
        second.candidate.token_id = first.candidate.token_id.clone();
        let outcome = store.insert_if_absent(&second, Some(&token_for(&second)), None).unwrap();
        assert_eq!(outcome, InsertOutcome::TokenTaken { owner: "t1".to_string() });
        assert!(store.find_by_transaction_id("t2").unwrap().is_none());
    }

    #[test]
    fn test_register_conflict_names_owner() {
        let store = SqliteLedger::open_in_memory().unwrap();
        let tok = UsedToken {
            token_id: "k".to_string(),
            transaction_id: "x".to_string(),
            consumed_at: at(0),
        };
        store.register(&tok).unwrap();
        let again = UsedToken {
            transaction_id: "y".to_string(),
            ..tok
        };
        match store.register(&again) {
            Err(RegisterError::Conflict(c)) => assert_eq!(c.owner, "x"),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.owner_of("k").unwrap().unwrap().transaction_id, "x");
    }

    #[test]
    fn test_window_queries() {
        let store = SqliteLedger::open_in_memory().unwrap();
        for (i, secs) in [0, 100, 200, 400].iter().enumerate() {
            let e = entry(&format!("t{}", i), "a", "b", 10.0, *secs);
            store.insert_if_absent(&e, None, None).unwrap();
        }
        let back = entry("r1", "b", "a", 1.0, 150);
        store.insert_if_absent(&back, None, None).unwrap();

        assert_eq!(store.count_in_window("a", at(100), at(400)).unwrap(), 3);
        assert_eq!(store.sum_in_window("a", at(0), at(200)).unwrap(), 30.0);
        assert_eq!(store.sum_in_window("nobody", at(0), at(200)).unwrap(), 0.0);
        assert!(store.exists_reverse_edge("a", "b", at(100), at(400)).unwrap());
        assert!(!store.exists_reverse_edge("a", "b", at(151), at(400)).unwrap());
        // Reverse payment after the upper bound does not count.
        assert!(!store.exists_reverse_edge("a", "b", at(0), at(149)).unwrap());

        let pairs = store.count_and_sum_by_sender_receiver(at(0)).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].sender_id, "a");
        assert_eq!(pairs[0].count, 4);
        let edges = store.distinct_edges(at(0)).unwrap();
        assert_eq!(edges, vec![("a".to_string(), "b".to_string()), ("b".to_string(), "a".to_string())]);
    }

    #[test]
    fn test_update_trust_unknown_user() {
        let store = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(store.update_trust("ghost", &|t| t + 0.25).unwrap(), None);
        store.upsert_user("alice", None, 0.5).unwrap();
        assert_eq!(store.update_trust("alice", &|t| t + 0.25).unwrap(), Some((0.5, 0.75)));
        assert_eq!(store.public_key("alice").unwrap(), None);
    }

    #[test]
    fn test_sender_trust_commits_with_entry_only() {
        let store = SqliteLedger::open_in_memory().unwrap();
        store.upsert_user("a", None, 0.5).unwrap();
        let penalty: &dyn Fn(f64) -> f64 = &|t| t - 0.25;

        let e = entry("t1", "a", "b", 5.0, 0);
        match store.insert_if_absent(&e, Some(&token_for(&e)), Some(penalty)).unwrap() {
            InsertOutcome::Inserted { trust_change, .. } => assert_eq!(trust_change, Some((0.5, 0.25))),
            other => panic!("expected Inserted, got {:?}", other),
        }

        // Neither a replayed id nor a lost token touches the score.
        assert!(!store.insert_if_absent(&e, None, Some(penalty)).unwrap().was_new());
        let mut rival = entry("t2", "a", "b", 5.0, 1);
        rival.candidate.token_id = "tok-t1".to_string();
        let outcome = store.insert_if_absent(&rival, Some(&token_for(&rival)), Some(penalty)).unwrap();
        assert!(matches!(outcome, InsertOutcome::TokenTaken { .. }));
        assert_eq!(store.trust_score("a").unwrap(), Some(0.25));

        let unknown = entry("t3", "ghost", "b", 5.0, 2);
        match store.insert_if_absent(&unknown, None, Some(penalty)).unwrap() {
            InsertOutcome::Inserted { trust_change, .. } => assert_eq!(trust_change, None),
            other => panic!("expected Inserted, got {:?}", other),
        }
    }

    #[test]
    fn test_audit_snapshot_flags_orphans() {
        let store = SqliteLedger::open_in_memory().unwrap();
        let e = entry("t1", "a", "b", 1.0, 0);
        store.insert_if_absent(&e, Some(&token_for(&e)), None).unwrap();
        store
            .register(&UsedToken {
                token_id: "stray".to_string(),
                transaction_id: "missing".to_string(),
                consumed_at: at(0),
            })
            .unwrap();
        let snap = store.audit_snapshot().unwrap();
        assert_eq!(snap.entries, 1);
        assert_eq!(snap.tokens, 2);
        assert_eq!(snap.orphan_tokens, vec!["stray".to_string()]);
        assert!(snap.unregistered_tokens.is_empty());
    }
}
