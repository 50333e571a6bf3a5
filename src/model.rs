use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Transaction as reported by a device during sync. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTransaction {
    pub transaction_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub invoice_id: Option<String>,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub token_id: String,
    pub signature: String,
    #[serde(default)]
    pub propagated_to_peers: u32,
    #[serde(default)]
    pub synced: bool,
}

impl CandidateTransaction {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, value) in [
            ("transaction_id", &self.transaction_id),
            ("sender_id", &self.sender_id),
            ("receiver_id", &self.receiver_id),
            ("token_id", &self.token_id),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::Missing(name));
            }
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ValidationError::Amount(self.amount));
        }
        Ok(())
    }

    /// SHA-256 over the fields a device asserts. Used to spot replays that
    /// reuse an id with different content.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        for part in [
            self.transaction_id.as_str(),
            self.sender_id.as_str(),
            self.receiver_id.as_str(),
            self.merchant_id.as_deref().unwrap_or(""),
            self.invoice_id.as_deref().unwrap_or(""),
            self.token_id.as_str(),
            self.signature.as_str(),
        ] {
            h.update(part.as_bytes());
            h.update([0x1f]);
        }
        h.update(self.amount.to_bits().to_be_bytes());
        h.update(self.timestamp.timestamp_millis().to_be_bytes());
        h.update(self.propagated_to_peers.to_be_bytes());
        hex::encode(h.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    DuplicateToken,
    HighAmount,
    BurstDetected,
    VelocityExceeded,
    NoPeerPropagation,
    CircularTransaction,
    InvalidSignature,
    SimulatedSignature,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::DuplicateToken => "DUPLICATE_TOKEN",
            RiskFlag::HighAmount => "HIGH_AMOUNT",
            RiskFlag::BurstDetected => "BURST_DETECTED",
            RiskFlag::VelocityExceeded => "VELOCITY_EXCEEDED",
            RiskFlag::NoPeerPropagation => "NO_PEER_PROPAGATION",
            RiskFlag::CircularTransaction => "CIRCULAR_TRANSACTION",
            RiskFlag::InvalidSignature => "INVALID_SIGNATURE",
            RiskFlag::SimulatedSignature => "SIMULATED_SIGNATURE",
        }
    }

    /// Additive contribution to the composite score.
    pub fn weight(&self) -> f64 {
        match self {
            RiskFlag::DuplicateToken => 0.5,
            RiskFlag::HighAmount => 0.2,
            RiskFlag::BurstDetected => 0.25,
            RiskFlag::VelocityExceeded => 0.2,
            RiskFlag::NoPeerPropagation => 0.1,
            RiskFlag::CircularTransaction => 0.2,
            RiskFlag::InvalidSignature => 0.3,
            RiskFlag::SimulatedSignature => 0.0,
        }
    }
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four risk bands. Closed set: scorer and classifier cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "Valid")]
    Valid,
    #[serde(rename = "Likely Honest Conflict")]
    LikelyHonestConflict,
    #[serde(rename = "Suspicious")]
    Suspicious,
    #[serde(rename = "Likely Fraud")]
    LikelyFraud,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Valid => "Valid",
            Classification::LikelyHonestConflict => "Likely Honest Conflict",
            Classification::Suspicious => "Suspicious",
            Classification::LikelyFraud => "Likely Fraud",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Valid" => Ok(Classification::Valid),
            "Likely Honest Conflict" => Ok(Classification::LikelyHonestConflict),
            "Suspicious" => Ok(Classification::Suspicious),
            "Likely Fraud" => Ok(Classification::LikelyFraud),
            other => Err(format!("unknown classification {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Food,
    Transport,
    Utilities,
    Entertainment,
    Health,
    Transfer,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Food => "FOOD",
            Category::Transport => "TRANSPORT",
            Category::Utilities => "UTILITIES",
            Category::Entertainment => "ENTERTAINMENT",
            Category::Health => "HEALTH",
            Category::Transfer => "TRANSFER",
            Category::Other => "OTHER",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FOOD" => Ok(Category::Food),
            "TRANSPORT" => Ok(Category::Transport),
            "UTILITIES" => Ok(Category::Utilities),
            "ENTERTAINMENT" => Ok(Category::Entertainment),
            "HEALTH" => Ok(Category::Health),
            "TRANSFER" => Ok(Category::Transfer),
            "OTHER" => Ok(Category::Other),
            other => Err(format!("unknown category {:?}", other)),
        }
    }
}

/// Accepted transaction, created exactly once per transaction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub candidate: CandidateTransaction,
    pub risk_score: f64,
    pub classification: Classification,
    pub risk_flags: Vec<RiskFlag>,
    pub category: Category,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedToken {
    pub token_id: String,
    pub transaction_id: String,
    pub consumed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub transaction_id: String,
    pub risk_score: f64,
    pub classification: Classification,
    pub risk_flags: Vec<RiskFlag>,
    pub synced: bool,
}

impl From<&LedgerEntry> for ReconciliationResult {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            transaction_id: entry.candidate.transaction_id.clone(),
            risk_score: entry.risk_score,
            classification: entry.classification,
            risk_flags: entry.risk_flags.clone(),
            synced: true,
        }
    }
}
