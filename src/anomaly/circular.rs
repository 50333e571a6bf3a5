use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use super::{AnomalyReport, Detector, Severity};
use crate::error::StoreError;
use crate::storage::LedgerStore;

/// Depth-bounded search for payment cycles returning to their origin.
pub struct CircularLoopDetector {
    min_len: usize,
    max_depth: usize,
}

impl CircularLoopDetector {
    pub fn new(min_len: usize, max_depth: usize) -> Self {
        Self { min_len, max_depth }
    }

    pub fn evaluate(&self, edges: &[(String, String)]) -> Vec<AnomalyReport> {
        let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (sender, receiver) in edges {
            if sender != receiver {
                graph.entry(sender.as_str()).or_default().insert(receiver.as_str());
            }
        }

        let mut seen: HashSet<Vec<&str>> = HashSet::new();
        let mut reports = Vec::new();
        for &start in graph.keys() {
            let mut stack: Vec<Vec<&str>> = vec![vec![start]];
            while let Some(path) = stack.pop() {
                let Some(node) = path.last() else { continue };
                let Some(next) = graph.get(node) else { continue };
                // Reverse so the stack pops neighbours in sorted order.
                for &neighbor in next.iter().rev() {
                    if neighbor == start {
                        if path.len() >= self.min_len && seen.insert(cycle_key(&path)) {
                            reports.push(self.report(&path, start));
                        }
                    } else if !path.contains(&neighbor) && path.len() < self.max_depth {
                        let mut extended = path.clone();
                        extended.push(neighbor);
                        stack.push(extended);
                    }
                }
            }
        }
        reports
    }

    fn report(&self, path: &[&str], start: &str) -> AnomalyReport {
        let depth = path.len();
        let mut closed: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        closed.push(start.to_string());
        AnomalyReport::CircularLoop {
            path: closed,
            depth,
            severity: if depth <= self.min_len { Severity::Medium } else { Severity::High },
        }
    }
}

/// Rotations and reflections of one cycle share a participant set.
fn cycle_key<'a>(path: &[&'a str]) -> Vec<&'a str> {
    let mut key = path.to_vec();
    key.sort_unstable();
    key
}

impl Detector for CircularLoopDetector {
    fn name(&self) -> &'static str {
        "circular_loop"
    }

    fn detect(&self, ledger: &dyn LedgerStore, since: DateTime<Utc>) -> Result<Vec<AnomalyReport>, StoreError> {
        let edges = ledger.distinct_edges(since)?;
        Ok(self.evaluate(&edges))
    }
}
