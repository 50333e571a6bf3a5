//! Batch anomaly detection over a trailing window of the ledger.
//!
//! Three independent, read-only detectors:
//! - [`collusion`]: reciprocal high-frequency transfers between two parties
//! - [`circular`]: directed payment cycles of bounded length
//! - [`burst`]: senders with abnormally many transactions
//!
//! Detectors see a best-effort snapshot; a failing detector is reported in
//! the sweep and does not stop the others.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::clock::Clock;
use crate::config::AnomalyConfig;
use crate::error::{StoreError, ValidationError};
use crate::logging::{log_anomaly, log_detector_failure, ProfileScope};
use crate::storage::LedgerStore;

pub mod burst;
pub mod circular;
pub mod collusion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyReport {
    Collusion {
        users: (String, String),
        forward_count: u64,
        reverse_count: u64,
        forward_amount: f64,
        reverse_amount: f64,
        severity: Severity,
    },
    CircularLoop {
        path: Vec<String>,
        depth: usize,
        severity: Severity,
    },
    BurstAbuse {
        user_id: String,
        transaction_count: u64,
        total_amount: f64,
        severity: Severity,
    },
}

impl AnomalyReport {
    pub fn severity(&self) -> Severity {
        match self {
            AnomalyReport::Collusion { severity, .. }
            | AnomalyReport::CircularLoop { severity, .. }
            | AnomalyReport::BurstAbuse { severity, .. } => *severity,
        }
    }
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, ledger: &dyn LedgerStore, since: DateTime<Utc>) -> Result<Vec<AnomalyReport>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorFailure {
    pub detector: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalySweep {
    pub window_hours: u64,
    pub reports: Vec<AnomalyReport>,
    pub failed_detectors: Vec<DetectorFailure>,
}

impl AnomalySweep {
    pub fn total(&self) -> usize {
        self.reports.len()
    }
}

pub struct AnomalyDetector {
    detectors: Vec<Box<dyn Detector>>,
    max_window_hours: u64,
}

impl AnomalyDetector {
    pub fn new(cfg: &AnomalyConfig) -> Self {
        Self::with_detectors(
            vec![
                Box::new(collusion::CollusionDetector::new(cfg.collusion_min_txs)),
                Box::new(circular::CircularLoopDetector::new(cfg.loop_min_len, cfg.loop_max_depth)),
                Box::new(burst::BurstAbuseDetector::new(cfg.burst_abuse_min, cfg.burst_abuse_high)),
            ],
            cfg.max_window_hours,
        )
    }

    pub fn with_detectors(detectors: Vec<Box<dyn Detector>>, max_window_hours: u64) -> Self {
        Self {
            detectors,
            max_window_hours,
        }
    }

    /// Run every detector over `[now - window_hours, now]`.
    pub fn detect_anomalies(
        &self,
        ledger: &dyn LedgerStore,
        clock: &dyn Clock,
        window_hours: u64,
    ) -> Result<AnomalySweep, ValidationError> {
        if window_hours == 0 || window_hours > self.max_window_hours {
            return Err(ValidationError::Window {
                got: window_hours,
                max: self.max_window_hours,
            });
        }
        let since = clock.now() - Duration::hours(window_hours as i64);

        let mut reports = Vec::new();
        let mut failed_detectors = Vec::new();
        for detector in &self.detectors {
            let _scope = ProfileScope::with_context("detector", &[("detector", json!(detector.name()))]);
            match detector.detect(ledger, since) {
                Ok(found) => {
                    found.iter().for_each(log_anomaly);
                    reports.extend(found);
                }
                Err(err) => {
                    log_detector_failure(detector.name(), &err.to_string());
                    failed_detectors.push(DetectorFailure {
                        detector: detector.name(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(AnomalySweep {
            window_hours,
            reports,
            failed_detectors,
        })
    }
}
