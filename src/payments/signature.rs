//! Request signing and verification for the payment gateways.
//!
//! Two schemes live here. The hosted-redirect gateway signs every call with
//! a salted SHA-256 digest carried in an `X-VERIFY` header; the embedded
//! checkout gateway signs callbacks with an HMAC-SHA256 over the order and
//! payment ids. Verification failures never panic: a bad signature is an
//! ordinary (and expected) input, not a program error.

use crate::payments::error::PaymentError;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compare two byte strings without early exit on the first mismatch.
///
/// Signature comparison must not leak where the strings diverge through
/// timing, so every byte is looked at regardless of earlier differences.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Salted-digest signer for the hosted-redirect gateway.
///
/// The signature is `sha256(base64_payload + endpoint_path + salt_key)` in
/// lowercase hex, suffixed with `###` and the salt index so the gateway
/// knows which key was used.
#[derive(Debug, Clone)]
pub struct XVerifySigner {
    salt_key: String,
    salt_index: String,
}

impl XVerifySigner {
    pub fn new(salt_key: impl Into<String>, salt_index: impl Into<String>) -> Self {
        Self {
            salt_key: salt_key.into(),
            salt_index: salt_index.into(),
        }
    }

    /// Sign a base64 payload for a given endpoint path. Status checks sign
    /// the path alone by passing an empty payload.
    pub fn sign(&self, base64_payload: &str, endpoint_path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base64_payload.as_bytes());
        hasher.update(endpoint_path.as_bytes());
        hasher.update(self.salt_key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}###{}", digest, self.salt_index)
    }

    /// Verify a presented `X-VERIFY` header against a payload and path.
    pub fn verify(&self, base64_payload: &str, endpoint_path: &str, presented: &str) -> bool {
        let expected = self.sign(base64_payload, endpoint_path);
        secure_eq(expected.as_bytes(), presented.trim().as_bytes())
    }
}

/// HMAC signer for embedded-checkout confirmations.
///
/// The signed message is `"{provider_order_id}|{provider_payment_id}"` and
/// the signature is the lowercase hex HMAC-SHA256 under the key secret.
#[derive(Debug, Clone)]
pub struct CheckoutSigner {
    secret: String,
}

impl CheckoutSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(
        &self,
        provider_order_id: &str,
        provider_payment_id: &str,
    ) -> Result<String, PaymentError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            PaymentError::ConfigurationError {
                message: "invalid HMAC key".to_string(),
            }
        })?;
        mac.update(format!("{}|{}", provider_order_id, provider_payment_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a browser-supplied signature. A forged or malformed signature
    /// returns `false`; it never errors.
    pub fn verify(
        &self,
        provider_order_id: &str,
        provider_payment_id: &str,
        presented: &str,
    ) -> bool {
        match self.sign(provider_order_id, provider_payment_id) {
            Ok(expected) => secure_eq(expected.as_bytes(), presented.trim().as_bytes()),
            Err(_) => false,
        }
    }
}

/// Verify an HMAC-SHA256 hex signature over an arbitrary payload, as used
/// for raw webhook bodies.
pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    secure_eq(expected.as_bytes(), signature.trim().as_bytes())
}
