//! Hashing and the toy keyed-MAC wallet scheme.
//!
//! Real signatures are deliberately out of scope for the simulation; an
//! HMAC-SHA256 over the transaction id, keyed by the sender's key material,
//! stands in for one. Key material is the address string itself, so any
//! node can verify and any holder of the address string can sign.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of `data`, rendered as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// HMAC-SHA256 of `message` under `key`, rendered as lowercase hex.
pub fn mac_hex(key: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check that `signature_hex` is the MAC of `message` under `key`.
pub fn verify_mac(key: &str, message: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_mac_roundtrip() {
        let sig = mac_hex("alice", "deadbeef");
        assert!(verify_mac("alice", "deadbeef", &sig));
        assert!(!verify_mac("bob", "deadbeef", &sig));
        assert!(!verify_mac("alice", "deadbeee", &sig));
    }

    #[test]
    fn test_verify_rejects_bad_hex() {
        assert!(!verify_mac("alice", "deadbeef", "not hex"));
    }
}
