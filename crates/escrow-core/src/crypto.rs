//! Signing keys and hashing helpers
//!
//! A party's `KeyRing` holds the Ed25519 signing key behind its `PubKeyRing`.
//! Contracts and transactions are signed over a SHA-256 digest of their
//! canonical serialization.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::types::PubKeyRing;

/// Private key material of the local party
#[derive(Clone)]
pub struct KeyRing {
    signing_key: SigningKey,
}

impl KeyRing {
    /// Generate a fresh key ring
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic key ring from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        PubKeyRing::new(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign arbitrary bytes, returning a hex-encoded signature
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }
}

impl core::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyRing")
            .field("pub_key_ring", &self.pub_key_ring())
            .finish()
    }
}

/// Verify a hex-encoded signature against a public key ring
pub fn verify_signature(key: &PubKeyRing, data: &[u8], signature_hex: &str) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(key.signature_pub_key()) else {
        return false;
    };
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    verifying_key
        .verify(data, &Signature::from_bytes(&bytes))
        .is_ok()
}

/// SHA-256 digest as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyRing::from_seed([3u8; 32]);
        let signature = keys.sign(b"contract");
        assert!(verify_signature(&keys.pub_key_ring(), b"contract", &signature));
        assert!(!verify_signature(&keys.pub_key_ring(), b"tampered", &signature));

        let other = KeyRing::from_seed([4u8; 32]);
        assert!(!verify_signature(&other.pub_key_ring(), b"contract", &signature));
        assert!(!verify_signature(&keys.pub_key_ring(), b"contract", "not-hex"));
    }
}
