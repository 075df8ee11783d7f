//! Signing primitives used to authenticate frames.
//!
//! The hub only depends on the [`MessageSigner`] / [`MessageVerifier`]
//! contracts. Ed25519 (via `ed25519-dalek`) is the provided backend.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Produces detached signatures for outgoing frames.
pub trait MessageSigner: Send {
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Public half, as announced in Join frames and the directory.
    fn public_key(&self) -> Vec<u8>;
}

/// Checks detached signatures against a sender's public key.
pub trait MessageVerifier: Send {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Ed25519 keypair.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }
}

impl MessageSigner for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.key.verifying_key())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl MessageVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::try_from(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let signer = Ed25519Signer::generate();
        let signature = signer.sign(b"hello");

        assert_eq!(signature.len(), 64);
        assert_eq!(signer.public_key().len(), 32);
        assert!(Ed25519Verifier.verify(b"hello", &signature, &signer.public_key()));
    }

    #[test]
    fn test_tampered_message_fails() {
        let signer = Ed25519Signer::generate();
        let signature = signer.sign(b"hello");
        assert!(!Ed25519Verifier.verify(b"hellp", &signature, &signer.public_key()));
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = Ed25519Signer::generate();
        let other = Ed25519Signer::generate();
        let signature = signer.sign(b"hello");
        assert!(!Ed25519Verifier.verify(b"hello", &signature, &other.public_key()));
    }

    #[test]
    fn test_malformed_inputs_fail() {
        let signer = Ed25519Signer::generate();
        let signature = signer.sign(b"hello");
        assert!(!Ed25519Verifier.verify(b"hello", &signature[..10], &signer.public_key()));
        assert!(!Ed25519Verifier.verify(b"hello", &signature, &[1, 2, 3]));
    }

    #[test]
    fn test_deterministic_from_secret() {
        let a = Ed25519Signer::from_secret(&[9; 32]);
        let b = Ed25519Signer::from_secret(&[9; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }
}
