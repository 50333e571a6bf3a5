//! End-to-end reconciliation against SQLite: idempotent replay, token
//! single-use, cross-connection races and trust feedback.

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, TimeZone, Utc};

use ledgerguard::clock::FixedClock;
use ledgerguard::model::{CandidateTransaction, Classification, RiskFlag};
use ledgerguard::reconcile::{Reconciler, SyncOutcome};
use ledgerguard::storage::{Identity, LedgerStore, SqliteLedger, TokenRegistry};
use ledgerguard::verify::invariants;
use ledgerguard::{Config, IntegrityEngine};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 18, 0, 0).unwrap()
}

fn candidate(id: &str, sender: &str, receiver: &str, amount: f64, token: &str) -> CandidateTransaction {
    CandidateTransaction {
        transaction_id: id.to_string(),
        sender_id: sender.to_string(),
        receiver_id: receiver.to_string(),
        merchant_id: None,
        invoice_id: None,
        amount,
        timestamp: now() - Duration::hours(1),
        token_id: token.to_string(),
        signature: "simulated_sig_device".to_string(),
        propagated_to_peers: 2,
        synced: false,
    }
}

fn reconciler(store: Arc<SqliteLedger>) -> Reconciler {
    Reconciler::with_sqlite(store, Arc::new(FixedClock(now())), &Config::default())
}

#[test]
fn test_resubmission_returns_identical_outcome() {
    let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
    let rec = reconciler(store.clone());
    let tx = candidate("tx-1", "u1", "u2", 8_000.0, "tok-1");

    let first = rec.reconcile(&tx).unwrap();
    assert_eq!(first.risk_flags, vec![RiskFlag::HighAmount, RiskFlag::SimulatedSignature]);
    assert_eq!(first.risk_score, 0.2);

    for _ in 0..3 {
        assert_eq!(rec.reconcile(&tx).unwrap(), first);
    }
    let snap = store.audit_snapshot().unwrap();
    assert_eq!(snap.entries, 1);
    assert_eq!(snap.tokens, 1);
}

#[test]
fn test_token_reuse_scores_no_lower_than_first_use() {
    let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
    let rec = reconciler(store.clone());

    let first = rec.reconcile(&candidate("a", "u1", "u2", 50.0, "shared")).unwrap();
    let second = rec.reconcile(&candidate("b", "u3", "u4", 50.0, "shared")).unwrap();

    assert!(!first.risk_flags.contains(&RiskFlag::DuplicateToken));
    assert!(second.risk_flags.contains(&RiskFlag::DuplicateToken));
    assert!(second.risk_score >= first.risk_score + 0.5);
    assert_eq!(store.owner_of("shared").unwrap().unwrap().transaction_id, "a");
    assert!(invariants::audit(&store).unwrap().is_clean());
}

#[test]
fn test_trust_feedback_applied_once() {
    let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
    store.upsert_user("u1", None, 0.9).unwrap();
    let rec = reconciler(store.clone());

    // Duplicate token + high amount + no propagation + simulated signature.
    rec.reconcile(&candidate("seed", "u9", "u8", 10.0, "burned")).unwrap();
    let mut fraud = candidate("f1", "u1", "u2", 60_000.0, "burned");
    fraud.propagated_to_peers = 0;

    let result = rec.reconcile(&fraud).unwrap();
    assert_eq!(result.classification, Classification::LikelyFraud);
    let after_first = store.trust_score("u1").unwrap().unwrap();
    assert!((after_first - 0.7).abs() < 1e-9);

    rec.reconcile(&fraud).unwrap();
    assert_eq!(store.trust_score("u1").unwrap().unwrap(), after_first);
}

#[test]
fn test_same_id_race_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite");
    let path = path.to_str().unwrap();
    let a = Arc::new(SqliteLedger::open(path).unwrap());
    let b = Arc::new(SqliteLedger::open(path).unwrap());

    let tx = candidate("race-1", "u1", "u2", 75.0, "tok-race");
    let handles: Vec<_> = [a.clone(), b]
        .into_iter()
        .map(|store| {
            let tx = tx.clone();
            thread::spawn(move || reconciler(store).reconcile(&tx).unwrap())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results[0], results[1]);
    let snap = a.audit_snapshot().unwrap();
    assert_eq!(snap.entries, 1);
    assert_eq!(snap.tokens, 1);
}

#[test]
fn test_token_race_across_connections_registers_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite");
    let path = path.to_str().unwrap();
    let a = Arc::new(SqliteLedger::open(path).unwrap());
    let b = Arc::new(SqliteLedger::open(path).unwrap());

    let handles: Vec<_> = [(a.clone(), "x"), (b, "y")]
        .into_iter()
        .map(|(store, id)| {
            let tx = candidate(id, id, "shop", 20.0, "contested");
            thread::spawn(move || reconciler(store).reconcile(&tx).unwrap())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let duplicates = results
        .iter()
        .filter(|r| r.risk_flags.contains(&RiskFlag::DuplicateToken))
        .count();
    assert_eq!(duplicates, 1);
    let winner = results
        .iter()
        .find(|r| !r.risk_flags.contains(&RiskFlag::DuplicateToken))
        .unwrap();
    assert_eq!(a.owner_of("contested").unwrap().unwrap().transaction_id, winner.transaction_id);
    assert!(a.find_by_transaction_id("x").unwrap().is_some());
    assert!(a.find_by_transaction_id("y").unwrap().is_some());
    assert!(invariants::audit(&a).unwrap().is_clean());
}

#[tokio::test]
async fn test_sync_batch_mixed_outcomes() {
    let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
    let engine = IntegrityEngine::sqlite(store.clone(), Arc::new(FixedClock(now())), Config::default());

    let negative = candidate("neg", "u1", "u2", -10.0, "tok-neg");
    let missing = candidate("", "u1", "u2", 10.0, "tok-missing");

    let outcomes = engine
        .sync_batch(vec![
            candidate("ok-1", "u1", "u2", 10.0, "tok-ok-1"),
            negative,
            missing,
            candidate("ok-2", "u1", "u2", 10.0, "tok-ok-1"),
        ])
        .await;

    assert!(matches!(outcomes[0], SyncOutcome::Reconciled(_)));
    assert!(matches!(&outcomes[1], SyncOutcome::Rejected { reason, .. } if reason.contains("amount")));
    assert!(matches!(outcomes[2], SyncOutcome::Rejected { .. }));
    let dup = outcomes[3].result().unwrap();
    assert!(dup.risk_flags.contains(&RiskFlag::DuplicateToken));
    assert!(!store.is_used("tok-neg").unwrap());

    let json = serde_json::to_value(&outcomes[0]).unwrap();
    assert_eq!(json["status"], "reconciled");
    assert_eq!(json["transaction_id"], "ok-1");
    assert_eq!(json["classification"], "Valid");
}
