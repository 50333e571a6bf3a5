use chrono::{DateTime, Utc};

use super::{AnomalyReport, Detector, Severity};
use crate::error::StoreError;
use crate::storage::{LedgerStore, SenderAggregate};

pub struct BurstAbuseDetector {
    min_txs: u64,
    high_txs: u64,
}

impl BurstAbuseDetector {
    pub fn new(min_txs: u64, high_txs: u64) -> Self {
        Self { min_txs, high_txs }
    }

    pub fn evaluate(&self, senders: &[SenderAggregate]) -> Vec<AnomalyReport> {
        senders
            .iter()
            .filter(|s| s.count >= self.min_txs)
            .map(|s| AnomalyReport::BurstAbuse {
                user_id: s.sender_id.clone(),
                transaction_count: s.count,
                total_amount: s.total,
                severity: if s.count >= self.high_txs { Severity::High } else { Severity::Medium },
            })
            .collect()
    }
}

impl Detector for BurstAbuseDetector {
    fn name(&self) -> &'static str {
        "burst_abuse"
    }

    fn detect(&self, ledger: &dyn LedgerStore, since: DateTime<Utc>) -> Result<Vec<AnomalyReport>, StoreError> {
        let senders = ledger.count_and_sum_by_sender(since)?;
        Ok(self.evaluate(&senders))
    }
}
