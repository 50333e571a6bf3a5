use std::sync::Arc;

use crate::category::categorize;
use crate::classify::classify;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{IntegrityError, StoreError};
use crate::logging::{
    log, log_duplicate_token, log_reconciled, log_replay_mismatch, log_trust_adjusted, obj, v_str, Domain, Level,
};
use crate::model::{CandidateTransaction, LedgerEntry, ReconciliationResult, RiskFlag, UsedToken};
use crate::risk::RiskScorer;
use crate::storage::{Identity, InsertOutcome, LedgerStore, SqliteLedger, TokenRegistry};
use crate::trust::TrustFeedback;

/// Attempts before giving up on a token registry that keeps disagreeing with
/// the commit step.
const MAX_COMMIT_ATTEMPTS: usize = 3;

pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    tokens: Arc<dyn TokenRegistry>,
    identity: Arc<dyn Identity>,
    clock: Arc<dyn Clock>,
    scorer: RiskScorer,
    trust: TrustFeedback,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        tokens: Arc<dyn TokenRegistry>,
        identity: Arc<dyn Identity>,
        clock: Arc<dyn Clock>,
        cfg: &Config,
    ) -> Self {
        Self {
            ledger,
            tokens,
            identity,
            clock,
            scorer: RiskScorer::new(cfg.risk.clone()),
            trust: TrustFeedback::new(cfg.trust.clone()),
        }
    }

    /// One SQLite database serving as ledger, token registry and identity layer.
    pub fn with_sqlite(store: Arc<SqliteLedger>, clock: Arc<dyn Clock>, cfg: &Config) -> Self {
        Self::new(store.clone(), store.clone(), store, clock, cfg)
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.identity
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn trust(&self) -> &TrustFeedback {
        &self.trust
    }

    /// Idempotent accept/score/persist/feedback for one candidate.
    ///
    /// A transaction id that is already in the ledger returns its stored
    /// outcome unchanged and has no side effects. The entry, its token and
    /// the sender's trust update commit together, so a storage failure leaves
    /// none of them behind and is returned as retryable.
    pub fn reconcile(&self, candidate: &CandidateTransaction) -> Result<ReconciliationResult, IntegrityError> {
        candidate.validate()?;

        if let Some(existing) = self.ledger.find_by_transaction_id(&candidate.transaction_id)? {
            return Ok(self.replay(candidate, &existing));
        }

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let entry = self.score(candidate)?;
            let duplicate = entry.risk_flags.contains(&RiskFlag::DuplicateToken);
            if duplicate {
                log_duplicate_token(&candidate.transaction_id, &candidate.token_id);
            }
            let token = (!duplicate).then(|| UsedToken {
                token_id: candidate.token_id.clone(),
                transaction_id: candidate.transaction_id.clone(),
                consumed_at: self.clock.now(),
            });

            let update = self.trust.immediate_update(entry.classification);
            let sender_trust = update.as_ref().map(|f| f as &dyn Fn(f64) -> f64);

            match self.ledger.insert_if_absent(&entry, token.as_ref(), sender_trust)? {
                InsertOutcome::Inserted { entry: stored, trust_change } => {
                    if let Some((before, after)) = trust_change {
                        log_trust_adjusted(&stored.candidate.sender_id, before, after, stored.classification.as_str());
                    }
                    let result = ReconciliationResult::from(&stored);
                    log_reconciled(&result, false);
                    return Ok(result);
                }
                InsertOutcome::Existing(stored) => return Ok(self.replay(candidate, &stored)),
                InsertOutcome::TokenTaken { owner } => {
                    // Lost the token to a concurrent submission; rescore so the
                    // duplicate shows up as a risk signal.
                    log(
                        Level::Info,
                        Domain::Token,
                        "token_race_lost",
                        obj(&[
                            ("transaction_id", v_str(&candidate.transaction_id)),
                            ("owner", v_str(&owner)),
                        ]),
                    );
                }
            }
        }

        Err(StoreError::Corrupt {
            key: candidate.transaction_id.clone(),
            reason: "token registry disagrees with commit".to_string(),
        }
        .into())
    }

    fn score(&self, candidate: &CandidateTransaction) -> Result<LedgerEntry, StoreError> {
        let assessment = self.scorer.assess(
            candidate,
            self.ledger.as_ref(),
            self.tokens.as_ref(),
            self.identity.as_ref(),
        )?;
        Ok(LedgerEntry {
            candidate: CandidateTransaction {
                synced: true,
                ..candidate.clone()
            },
            risk_score: assessment.score,
            classification: classify(assessment.score),
            risk_flags: assessment.flags,
            category: categorize(candidate),
            fingerprint: candidate.fingerprint(),
        })
    }

    fn replay(&self, candidate: &CandidateTransaction, stored: &LedgerEntry) -> ReconciliationResult {
        let submitted = candidate.fingerprint();
        if submitted != stored.fingerprint {
            log_replay_mismatch(&candidate.transaction_id, &stored.fingerprint, &submitted);
        }
        let result = ReconciliationResult::from(stored);
        log_reconciled(&result, true);
        result
    }
}
