use chrono::Duration;

use crate::config::RiskConfig;
use crate::error::StoreError;
use crate::logging::log_risk_signal;
use crate::model::{CandidateTransaction, RiskFlag};
use crate::signature;
use crate::storage::{Identity, LedgerStore, TokenRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub score: f64,
    pub flags: Vec<RiskFlag>,
}

impl RiskAssessment {
    pub fn has(&self, flag: RiskFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Round to 4 decimal places so stored and freshly computed scores compare equal.
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

pub struct RiskScorer {
    cfg: RiskConfig,
}

impl RiskScorer {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Score one candidate against committed ledger state. Read-only.
    pub fn assess(
        &self,
        tx: &CandidateTransaction,
        ledger: &dyn LedgerStore,
        tokens: &dyn TokenRegistry,
        identity: &dyn Identity,
    ) -> Result<RiskAssessment, StoreError> {
        let mut flags = Vec::new();
        let id = tx.transaction_id.as_str();

        if tokens.is_used(&tx.token_id)? {
            flags.push(RiskFlag::DuplicateToken);
        }

        if tx.amount > self.cfg.high_amount_threshold {
            log_risk_signal(id, "HIGH_AMOUNT", tx.amount, self.cfg.high_amount_threshold);
            flags.push(RiskFlag::HighAmount);
        }

        let burst_start = tx.timestamp - Duration::seconds(self.cfg.burst_window_secs);
        let recent = ledger.count_in_window(&tx.sender_id, burst_start, tx.timestamp)?;
        if recent >= self.cfg.burst_threshold {
            log_risk_signal(id, "BURST_DETECTED", recent as f64, self.cfg.burst_threshold as f64);
            flags.push(RiskFlag::BurstDetected);
        }

        let velocity_start = tx.timestamp - Duration::seconds(self.cfg.velocity_window_secs);
        let moved = ledger.sum_in_window(&tx.sender_id, velocity_start, tx.timestamp)? + tx.amount;
        if moved > self.cfg.velocity_ceiling {
            log_risk_signal(id, "VELOCITY_EXCEEDED", moved, self.cfg.velocity_ceiling);
            flags.push(RiskFlag::VelocityExceeded);
        }

        if tx.propagated_to_peers == 0 {
            flags.push(RiskFlag::NoPeerPropagation);
        }

        if ledger.exists_reverse_edge(&tx.sender_id, &tx.receiver_id, burst_start, tx.timestamp)? {
            flags.push(RiskFlag::CircularTransaction);
        }

        if let Some(flag) = self.signature_flag(tx, identity)? {
            flags.push(flag);
        }

        let total: f64 = flags.iter().map(RiskFlag::weight).sum();
        Ok(RiskAssessment {
            score: round4(total.min(1.0)),
            flags,
        })
    }

    fn signature_flag(
        &self,
        tx: &CandidateTransaction,
        identity: &dyn Identity,
    ) -> Result<Option<RiskFlag>, StoreError> {
        if let Some(public_key) = identity.public_key(&tx.sender_id)? {
            let payload = signature::signing_payload(tx);
            if signature::verify(&public_key, &payload, &tx.signature) {
                return Ok(None);
            }
            return Ok(Some(RiskFlag::InvalidSignature));
        }
        if signature::is_simulated(&tx.signature, &self.cfg.simulated_signature_prefix) {
            // Trust boundary: placeholder signatures are only tolerated while
            // device signing is not rolled out.
            return Ok(Some(if self.cfg.allow_simulated_signatures {
                RiskFlag::SimulatedSignature
            } else {
                RiskFlag::InvalidSignature
            }));
        }
        Ok(None)
    }
}
