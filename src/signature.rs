//! EIP-191 personal-sign verification for the worker back-channel
//!
//! Workers authenticate by signing the canonical JSON serialization of their
//! auth fields with their wallet key. The gateway recovers the signer's
//! public key from the 65-byte signature and derives the wallet address
//! (last 20 bytes of the Keccak-256 of the uncompressed key). The same
//! primitives sign outbound usage reports when a gateway key is configured.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1, SecretKey};
use serde::Serialize;
use sha3::{Digest, Keccak256};

use crate::error::GatewayError;

/// Canonical auth payload: exactly this key order is what a worker signs.
#[derive(Debug, Serialize)]
pub struct AuthPayload<'a> {
    pub address: &'a str,
    pub model: &'a str,
    pub timestamp: i64,
}

impl AuthPayload<'_> {
    pub fn canonical(&self) -> String {
        // serde_json preserves struct field order
        serde_json::to_string(self).expect("auth payload serializes")
    }
}

/// EIP-191 digest: keccak256("\x19Ethereum Signed Message:\n<len><message>")
pub fn personal_sign_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

fn decode_signature(signature: &str) -> Result<RecoverableSignature, GatewayError> {
    let raw = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|_| GatewayError::Unauthorized("signature is not hex".into()))?;
    if raw.len() != 65 {
        return Err(GatewayError::Unauthorized("signature must be 65 bytes".into()));
    }
    let mut v = raw[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id = RecoveryId::from_i32(v as i32)
        .map_err(|_| GatewayError::Unauthorized("invalid recovery id".into()))?;
    RecoverableSignature::from_compact(&raw[..64], recovery_id)
        .map_err(|_| GatewayError::Unauthorized("malformed signature".into()))
}

/// Recover the signer's wallet address from a personal-sign signature.
pub fn recover_address(message: &[u8], signature: &str) -> Result<String, GatewayError> {
    let sig = decode_signature(signature)?;
    let digest = personal_sign_digest(message);
    let msg = Message::from_digest_slice(&digest)
        .map_err(|_| GatewayError::Unauthorized("invalid digest".into()))?;
    let secp = Secp256k1::verification_only();
    let pubkey = secp
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| GatewayError::Unauthorized("signature recovery failed".into()))?;
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    Ok(format!("0x{}", hex::encode(&hash[12..])))
}

/// Verify that `signature` over `message` was produced by `address`.
pub fn verify_wallet_signature(
    address: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), GatewayError> {
    let recovered = recover_address(message, signature)?;
    if recovered.eq_ignore_ascii_case(address) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized(format!(
            "signature recovers to {recovered}, not {address}"
        )))
    }
}

/// Personal-sign `message` with a hex-encoded secp256k1 key. Returns the
/// 0x-prefixed 65-byte signature.
pub fn sign_message(secret_hex: &str, message: &[u8]) -> Result<String, GatewayError> {
    let raw = hex::decode(secret_hex.trim_start_matches("0x"))
        .map_err(|_| GatewayError::Unauthorized("signing key is not hex".into()))?;
    let secret = SecretKey::from_slice(&raw)
        .map_err(|_| GatewayError::Unauthorized("invalid signing key".into()))?;
    let digest = personal_sign_digest(message);
    let msg = Message::from_digest_slice(&digest)
        .map_err(|_| GatewayError::Unauthorized("invalid digest".into()))?;
    let secp = Secp256k1::new();
    let (recovery_id, compact) = secp.sign_ecdsa_recoverable(&msg, &secret).serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8 + 27;
    Ok(format!("0x{}", hex::encode(out)))
}

/// Derive the wallet address for a hex secret key (testing and report signing).
pub fn address_of(secret_hex: &str) -> Result<String, GatewayError> {
    let raw = hex::decode(secret_hex.trim_start_matches("0x"))
        .map_err(|_| GatewayError::Unauthorized("signing key is not hex".into()))?;
    let secret = SecretKey::from_slice(&raw)
        .map_err(|_| GatewayError::Unauthorized("invalid signing key".into()))?;
    let secp = Secp256k1::new();
    let pubkey = secret.public_key(&secp);
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    Ok(format!("0x{}", hex::encode(&hash[12..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe512961708279f1d8b1b5b6b1b2b3b4";

    #[test]
    fn canonical_payload_key_order() {
        let payload = AuthPayload { address: "0xabc", model: "plumise-chat", timestamp: 1700000000 };
        assert_eq!(
            payload.canonical(),
            r#"{"address":"0xabc","model":"plumise-chat","timestamp":1700000000}"#
        );
    }

    #[test]
    fn sign_and_recover_round_trip() {
        let address = address_of(KEY).unwrap();
        let message = b"hello gateway";
        let sig = sign_message(KEY, message).unwrap();
        assert_eq!(recover_address(message, &sig).unwrap(), address);
        assert!(verify_wallet_signature(&address, message, &sig).is_ok());
        // case-insensitive address compare
        assert!(verify_wallet_signature(&address.to_uppercase(), message, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let address = address_of(KEY).unwrap();
        let sig = sign_message(KEY, b"hello gateway").unwrap();
        assert!(verify_wallet_signature(&address, b"hello gateway!", &sig).is_err());
    }

    #[test]
    fn wrong_address_fails_verification() {
        let sig = sign_message(KEY, b"hello gateway").unwrap();
        assert!(verify_wallet_signature(
            "0x0000000000000000000000000000000000000001",
            b"hello gateway",
            &sig
        )
        .is_err());
    }

    #[test]
    fn garbage_signatures_are_rejected() {
        assert!(recover_address(b"m", "not-hex").is_err());
        assert!(recover_address(b"m", "0xdead").is_err());
        assert!(recover_address(b"m", &format!("0x{}", "00".repeat(65))).is_err());
    }
}
