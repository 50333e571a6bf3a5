use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::{AnomalyReport, Detector, Severity};
use crate::error::StoreError;
use crate::storage::{LedgerStore, PairAggregate};

/// Flags unordered pairs where both directions carry at least `min_txs`
/// transactions inside the window.
pub struct CollusionDetector {
    min_txs: u64,
}

impl CollusionDetector {
    pub fn new(min_txs: u64) -> Self {
        Self { min_txs }
    }

    pub fn evaluate(&self, pairs: &[PairAggregate]) -> Vec<AnomalyReport> {
        let busy: HashMap<(&str, &str), &PairAggregate> = pairs
            .iter()
            .filter(|p| p.count >= self.min_txs)
            .map(|p| ((p.sender_id.as_str(), p.receiver_id.as_str()), p))
            .collect();

        let mut ordered: Vec<&PairAggregate> = busy.values().copied().collect();
        ordered.sort_by(|a, b| (&a.sender_id, &a.receiver_id).cmp(&(&b.sender_id, &b.receiver_id)));

        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut reports = Vec::new();
        for pair in ordered {
            let key = canonical_pair(&pair.sender_id, &pair.receiver_id);
            if key.0 == key.1 || seen.contains(&key) {
                continue;
            }
            let (Some(forward), Some(reverse)) = (busy.get(&key), busy.get(&(key.1, key.0))) else {
                continue;
            };
            seen.insert(key);
            reports.push(AnomalyReport::Collusion {
                users: (key.0.to_string(), key.1.to_string()),
                forward_count: forward.count,
                reverse_count: reverse.count,
                forward_amount: forward.total,
                reverse_amount: reverse.total,
                severity: Severity::High,
            });
        }
        reports
    }
}

fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Detector for CollusionDetector {
    fn name(&self) -> &'static str {
        "collusion"
    }

    fn detect(&self, ledger: &dyn LedgerStore, since: DateTime<Utc>) -> Result<Vec<AnomalyReport>, StoreError> {
        let pairs = ledger.count_and_sum_by_sender_receiver(since)?;
        Ok(self.evaluate(&pairs))
    }
}
