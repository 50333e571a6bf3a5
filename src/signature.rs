use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::SecondsFormat;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::model::CandidateTransaction;

/// Canonical signed payload: `transaction_id:sender:receiver:amount:timestamp`.
/// Amount uses debug float formatting (`500.0`), timestamp RFC 3339 UTC.
pub fn signing_payload(tx: &CandidateTransaction) -> String {
    format!(
        "{}:{}:{}:{:?}:{}",
        tx.transaction_id,
        tx.sender_id,
        tx.receiver_id,
        tx.amount,
        tx.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
}

/// Verify a base64 Ed25519 signature against a hex-encoded public key.
/// Malformed keys or signatures verify as false.
pub fn verify(public_key_hex: &str, payload: &str, signature_b64: &str) -> bool {
    let key_bytes: [u8; 32] = match hex::decode(public_key_hex.trim()) {
        Ok(bytes) => match bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    let key = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig_bytes = match STANDARD.decode(signature_b64.trim()) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(&sig_bytes) {
        Ok(s) => s,
        Err(_) => return false,
    };
    key.verify(payload.as_bytes(), &signature).is_ok()
}

/// Placeholder signatures emitted by devices that have no signing key yet.
pub fn is_simulated(signature: &str, prefix: &str) -> bool {
    !prefix.is_empty() && signature.starts_with(prefix)
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use chrono::{TimeZone, Utc};

    fn tx() -> CandidateTransaction {
        CandidateTransaction {
            transaction_id: "tx-42".to_string(),
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            merchant_id: None,
            invoice_id: None,
            amount: 500.0,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            token_id: "tok".to_string(),
            signature: String::new(),
            propagated_to_peers: 1,
            synced: false,
        }
    }

    #[test]
    fn test_payload_format() {
        assert_eq!(signing_payload(&tx()), "tx-42:alice:bob:500.0:2026-01-02T03:04:05Z");
    }

    #[test]
    fn test_valid_signature_verifies() {
        let key = signing_key(7);
        let t = tx();
        let sig = sign(&key, &t);
        assert!(verify(&public_hex(&key), &signing_payload(&t), &sig));
    }

    #[test]
    fn test_tampered_amount_fails() {
        let key = signing_key(7);
        let t = tx();
        let sig = sign(&key, &t);
        let mut tampered = t.clone();
        tampered.amount = 5000.0;
        assert!(!verify(&public_hex(&key), &signing_payload(&tampered), &sig));
    }

    #[test]
    fn test_garbage_inputs_fail_closed() {
        let key = signing_key(7);
        let payload = signing_payload(&tx());
        assert!(!verify("not-hex", &payload, "AAAA"));
        assert!(!verify(&public_hex(&key), &payload, "%%%"));
        assert!(!verify(&public_hex(&key), &payload, "simulated_sig_123"));
    }

    #[test]
    fn test_simulated_prefix() {
        assert!(is_simulated("simulated_sig_99", "simulated_sig_"));
        assert!(!is_simulated("c2ln", "simulated_sig_"));
        assert!(!is_simulated("anything", ""));
    }
}
