//! Async front door used by the sync endpoint and the operator CLI.
//!
//! Reconciliation itself is blocking (SQLite round-trips), so each candidate
//! runs on the blocking pool under a per-transaction-id lock. Candidates of
//! one batch are processed strictly in submission order; different batches
//! may run concurrently.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::anomaly::{AnomalyDetector, AnomalySweep};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{IntegrityError, StoreError};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{CandidateTransaction, LedgerEntry, ReconciliationResult};
use crate::reconcile::{Reconciler, SyncOutcome};
use crate::reliability::circuit::CircuitBreaker;
use crate::reliability::retry::retry_async;
use crate::storage::SqliteLedger;

const LOCK_STRIPES: usize = 64;

/// Striped mutexes keyed by transaction id. Two submissions of the same id
/// never reconcile at the same time; distinct ids rarely contend.
struct KeyedLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyedLocks {
    fn new(n: usize) -> Self {
        Self {
            stripes: (0..n.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn acquire(&self, key: &str) -> Result<MutexGuard<'_, ()>, StoreError> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        let idx = (h.finish() % self.stripes.len() as u64) as usize;
        self.stripes[idx].lock().map_err(|_| StoreError::Poisoned)
    }
}

pub struct IntegrityEngine {
    reconciler: Arc<Reconciler>,
    detector: AnomalyDetector,
    locks: Arc<KeyedLocks>,
    cfg: Config,
}

impl IntegrityEngine {
    pub fn new(reconciler: Reconciler, cfg: Config) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            detector: AnomalyDetector::new(&cfg.anomaly),
            locks: Arc::new(KeyedLocks::new(LOCK_STRIPES)),
            cfg,
        }
    }

    pub fn sqlite(store: Arc<SqliteLedger>, clock: Arc<dyn Clock>, cfg: Config) -> Self {
        let reconciler = Reconciler::with_sqlite(store, clock, &cfg);
        Self::new(reconciler, cfg)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Reconcile a device's batch in order. Every candidate gets exactly one
    /// outcome, in the same position as it was submitted.
    pub async fn sync_batch(&self, candidates: Vec<CandidateTransaction>) -> Vec<SyncOutcome> {
        let mut breaker = CircuitBreaker::new(self.cfg.retry.breaker_threshold);
        let mut outcomes = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let transaction_id = candidate.transaction_id.clone();
            if let Err(err) = candidate.validate() {
                outcomes.push(reject(transaction_id, err.to_string()));
                continue;
            }
            if !breaker.allow() {
                outcomes.push(SyncOutcome::Failed {
                    transaction_id,
                    error: "storage circuit open".to_string(),
                    retryable: true,
                });
                continue;
            }

            let candidate = Arc::new(candidate);
            let result = retry_async(&self.cfg.retry, "reconcile", IntegrityError::is_retryable, || {
                let reconciler = self.reconciler.clone();
                let locks = self.locks.clone();
                let candidate = candidate.clone();
                async move {
                    let joined = tokio::task::spawn_blocking(move || -> Result<ReconciliationResult, IntegrityError> {
                        let _guard = locks.acquire(&candidate.transaction_id)?;
                        reconciler.reconcile(&candidate)
                    })
                    .await;
                    match joined {
                        Ok(result) => result,
                        Err(e) => Err(IntegrityError::Worker(e.to_string())),
                    }
                }
            })
            .await;

            match result {
                Ok(r) => {
                    breaker.record_success();
                    outcomes.push(SyncOutcome::Reconciled(r));
                }
                Err(IntegrityError::Validation(err)) => outcomes.push(reject(transaction_id, err.to_string())),
                Err(err) => {
                    breaker.record_failure();
                    log(
                        Level::Error,
                        Domain::Reconcile,
                        "reconcile_failed",
                        obj(&[
                            ("transaction_id", v_str(&transaction_id)),
                            ("error", v_str(&err.to_string())),
                            ("consecutive_failures", v_num(breaker.failures as f64)),
                        ]),
                    );
                    outcomes.push(SyncOutcome::Failed {
                        transaction_id,
                        retryable: err.is_retryable(),
                        error: err.to_string(),
                    });
                }
            }
        }

        outcomes
    }

    /// `None` uses the configured default window.
    pub fn detect_anomalies(&self, window_hours: Option<u64>) -> Result<AnomalySweep, IntegrityError> {
        let hours = window_hours.unwrap_or(self.cfg.anomaly.default_window_hours);
        let sweep = self.detector.detect_anomalies(
            self.reconciler.ledger().as_ref(),
            self.reconciler.clock().as_ref(),
            hours,
        )?;
        Ok(sweep)
    }

    /// Advisory batch trust adjustment for `user_id`. Nothing is written.
    pub fn trust_adjustment(&self, user_id: &str, window_hours: Option<u64>) -> Result<f64, IntegrityError> {
        let hours = window_hours.unwrap_or(self.reconciler.trust().config().batch_window_hours);
        let adjustment = self.reconciler.trust().batch_adjustment(
            self.reconciler.ledger().as_ref(),
            user_id,
            self.reconciler.clock().now(),
            hours,
        )?;
        Ok(adjustment)
    }

    pub fn trust_score(&self, user_id: &str) -> Result<Option<f64>, IntegrityError> {
        Ok(self.reconciler.identity().trust_score(user_id)?)
    }

    pub fn ledger_for(&self, user_id: &str, limit: usize) -> Result<Vec<LedgerEntry>, IntegrityError> {
        Ok(self.reconciler.ledger().entries_for_user(user_id, limit)?)
    }
}

fn reject(transaction_id: String, reason: String) -> SyncOutcome {
    log(
        Level::Warn,
        Domain::Reconcile,
        "rejected",
        obj(&[("transaction_id", v_str(&transaction_id)), ("reason", v_str(&reason))]),
    );
    SyncOutcome::Rejected { transaction_id, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{Classification, UsedToken};
    use crate::reliability::retry::RetryConfig;
    use crate::storage::{InsertOutcome, LedgerStore, PairAggregate, SenderAggregate};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap()
    }

    fn tx(id: &str) -> CandidateTransaction {
        CandidateTransaction {
            transaction_id: id.to_string(),
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            merchant_id: None,
            invoice_id: None,
            amount: 25.0,
            timestamp: t0() - Duration::minutes(5),
            token_id: format!("tok-{}", id),
            signature: "simulated_sig_1".to_string(),
            propagated_to_peers: 2,
            synced: false,
        }
    }

    fn engine() -> (Arc<SqliteLedger>, IntegrityEngine) {
        let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let engine = IntegrityEngine::sqlite(store.clone(), Arc::new(FixedClock(t0())), Config::default());
        (store, engine)
    }

    /// Ledger that is always down.
    struct DownLedger;

    fn down() -> StoreError {
        StoreError::Poisoned
    }

    impl LedgerStore for DownLedger {
        fn find_by_transaction_id(&self, _: &str) -> Result<Option<LedgerEntry>, StoreError> {
            Err(down())
        }
        fn insert_if_absent(
            &self,
            _: &LedgerEntry,
            _: Option<&UsedToken>,
            _: Option<&dyn Fn(f64) -> f64>,
        ) -> Result<InsertOutcome, StoreError> {
            Err(down())
        }
        fn count_and_sum_by_sender_receiver(&self, _: DateTime<Utc>) -> Result<Vec<PairAggregate>, StoreError> {
            Err(down())
        }
        fn count_and_sum_by_sender(&self, _: DateTime<Utc>) -> Result<Vec<SenderAggregate>, StoreError> {
            Err(down())
        }
        fn count_in_window(&self, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(down())
        }
        fn sum_in_window(&self, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<f64, StoreError> {
            Err(down())
        }
        fn exists_reverse_edge(&self, _: &str, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<bool, StoreError> {
            Err(down())
        }
        fn distinct_edges(&self, _: DateTime<Utc>) -> Result<Vec<(String, String)>, StoreError> {
            Err(down())
        }
        fn classifications_for_sender(&self, _: &str, _: DateTime<Utc>) -> Result<Vec<Classification>, StoreError> {
            Err(down())
        }
        fn entries_for_user(&self, _: &str, _: usize) -> Result<Vec<LedgerEntry>, StoreError> {
            Err(down())
        }
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_rejects_invalid() {
        let (store, engine) = engine();
        let mut bad = tx("t2");
        bad.amount = 0.0;
        let outcomes = engine.sync_batch(vec![tx("t1"), bad, tx("t3")]).await;

        let ids: Vec<_> = outcomes.iter().map(SyncOutcome::transaction_id).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert!(outcomes[0].result().is_some());
        assert!(matches!(outcomes[1], SyncOutcome::Rejected { .. }));
        assert!(outcomes[2].result().is_some());
        assert!(store.find_by_transaction_id("t2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_id_twice_in_batch_is_idempotent() {
        let (store, engine) = engine();
        let outcomes = engine.sync_batch(vec![tx("t1"), tx("t1")]).await;
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(store.audit_snapshot().unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_storage_outage_fails_fast_after_breaker_opens() {
        let store = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let cfg = Config {
            retry: RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
                breaker_threshold: 2,
                ..RetryConfig::default()
            },
            ..Config::default()
        };
        let reconciler = Reconciler::new(
            Arc::new(DownLedger),
            store.clone(),
            store,
            Arc::new(FixedClock(t0())),
            &cfg,
        );
        let engine = IntegrityEngine::new(reconciler, cfg);

        let outcomes = engine.sync_batch(vec![tx("a"), tx("b"), tx("c"), tx("d")]).await;
        for outcome in &outcomes {
            match outcome {
                SyncOutcome::Failed { retryable, .. } => assert!(retryable),
                other => panic!("expected failure, got {:?}", other),
            }
        }
        match &outcomes[3] {
            SyncOutcome::Failed { error, .. } => assert_eq!(error, "storage circuit open"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_trust_adjustment_and_window_validation() {
        let (store, engine) = engine();
        store.upsert_user("alice", None, 1.0).unwrap();
        let batch = (0..3).map(|i| tx(&format!("v{}", i))).collect();
        engine.sync_batch(batch).await;

        assert_eq!(engine.trust_adjustment("alice", None).unwrap(), 0.05);
        assert_eq!(engine.trust_adjustment("nobody", None).unwrap(), 0.0);
        for hours in [0, 721, 10_000_000_000, u64::MAX] {
            let err = engine.trust_adjustment("alice", Some(hours)).unwrap_err();
            assert!(!err.is_retryable());
        }
        assert!(engine.detect_anomalies(Some(0)).is_err());
        assert!(engine.detect_anomalies(Some(721)).is_err());
        assert!(engine.detect_anomalies(None).unwrap().reports.is_empty());
        assert_eq!(engine.ledger_for("bob", 10).unwrap().len(), 3);
    }
}
