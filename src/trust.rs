//! Trust score feedback.
//!
//! Two rules feed a user's reputation:
//! - an immediate per-transaction nudge, committed together with the first
//!   persist of the transaction;
//! - an advisory batch adjustment over the user's recent outgoing history,
//!   returned to the caller and never written here.

use chrono::{DateTime, Duration, Utc};

use crate::config::TrustConfig;
use crate::error::{IntegrityError, ValidationError};
use crate::model::Classification;
use crate::risk::round4;
use crate::storage::LedgerStore;

/// Clamp into [0, 1]. NaN collapses to 0.
pub fn clamp_trust(x: f64) -> f64 {
    x.max(0.0).min(1.0)
}

pub fn apply_adjustment(current: f64, delta: f64) -> f64 {
    clamp_trust(current + delta)
}

pub struct TrustFeedback {
    cfg: TrustConfig,
}

impl TrustFeedback {
    pub fn new(cfg: TrustConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.cfg
    }

    pub fn immediate_delta(&self, classification: Classification) -> f64 {
        match classification {
            Classification::LikelyFraud => -self.cfg.fraud_penalty,
            Classification::Suspicious => -self.cfg.suspicious_penalty,
            Classification::Valid => self.cfg.valid_reward,
            Classification::LikelyHonestConflict => 0.0,
        }
    }

    /// Score update for the sender of a first-time persist, handed to the
    /// store so it commits with the entry. `None` when the band has no delta.
    pub fn immediate_update(&self, classification: Classification) -> Option<impl Fn(f64) -> f64> {
        let delta = self.immediate_delta(classification);
        (delta != 0.0).then(move || move |current: f64| apply_adjustment(current, delta))
    }

    /// `w_valid * valid - w_fraud * fraud - w_suspicious * suspicious`, each
    /// a fraction of the window's outgoing transactions, to 4 decimals.
    pub fn adjustment_from(&self, history: &[Classification]) -> f64 {
        if history.is_empty() {
            return 0.0;
        }
        let total = history.len() as f64;
        let frac = |band: Classification| history.iter().filter(|c| **c == band).count() as f64 / total;
        let adjustment = self.cfg.batch_valid_weight * frac(Classification::Valid)
            - self.cfg.batch_fraud_weight * frac(Classification::LikelyFraud)
            - self.cfg.batch_suspicious_weight * frac(Classification::Suspicious);
        round4(adjustment)
    }

    /// Over `[now - window_hours, now]`; the window must be within
    /// `1..=max_window_hours`.
    pub fn batch_adjustment(
        &self,
        ledger: &dyn LedgerStore,
        user_id: &str,
        now: DateTime<Utc>,
        window_hours: u64,
    ) -> Result<f64, IntegrityError> {
        if window_hours == 0 || window_hours > self.cfg.max_window_hours {
            return Err(ValidationError::Window {
                got: window_hours,
                max: self.cfg.max_window_hours,
            }
            .into());
        }
        let since = now - Duration::hours(window_hours as i64);
        let history = ledger.classifications_for_sender(user_id, since)?;
        Ok(self.adjustment_from(&history))
    }
}
