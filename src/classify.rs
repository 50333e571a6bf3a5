use crate::model::Classification;

pub const HONEST_CONFLICT_FLOOR: f64 = 0.3;
pub const SUSPICIOUS_FLOOR: f64 = 0.6;
pub const FRAUD_FLOOR: f64 = 0.8;

/// Map a composite score to its band. Lower bounds are inclusive.
pub fn classify(score: f64) -> Classification {
    if score < HONEST_CONFLICT_FLOOR {
        Classification::Valid
    } else if score < SUSPICIOUS_FLOOR {
        Classification::LikelyHonestConflict
    } else if score < FRAUD_FLOOR {
        Classification::Suspicious
    } else {
        Classification::LikelyFraud
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        assert_eq!(classify(0.0), Classification::Valid);
        assert_eq!(classify(0.29), Classification::Valid);
        assert_eq!(classify(0.30), Classification::LikelyHonestConflict);
        assert_eq!(classify(0.59), Classification::LikelyHonestConflict);
        assert_eq!(classify(0.60), Classification::Suspicious);
        assert_eq!(classify(0.79), Classification::Suspicious);
        assert_eq!(classify(0.80), Classification::LikelyFraud);
        assert_eq!(classify(1.0), Classification::LikelyFraud);
    }
}
