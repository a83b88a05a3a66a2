//! Field sealing and project key proofs
//!
//! Content fields written to the remote store pass through a [`FieldCipher`].
//! The cipher itself is supplied by the embedding application; without one,
//! [`PassThrough`] leaves values untouched.
//!
//! A project key never leaves the machine. Peers share a key proof instead,
//! which lets someone holding a candidate key check it before use.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Errors from sealing or opening a field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Failed to seal field: {0}")]
    Seal(String),

    #[error("Failed to open field: {0}")]
    Open(String),
}

/// Reversible transform applied to content fields at the remote boundary
pub trait FieldCipher: Send + Sync {
    /// Transform a plaintext value for storage
    fn seal(&self, plain: &str) -> Result<String, CipherError>;

    /// Recover the plaintext of a stored value
    fn open(&self, sealed: &str) -> Result<String, CipherError>;
}

/// Cipher that stores values as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl FieldCipher for PassThrough {
    fn seal(&self, plain: &str) -> Result<String, CipherError> {
        Ok(plain.to_string())
    }

    fn open(&self, sealed: &str) -> Result<String, CipherError> {
        Ok(sealed.to_string())
    }
}

/// Generate a fresh random project key
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Proof that the holder of `key` set up `project`
pub fn key_proof(key: &str, project: &Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(project.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Check a candidate key against a shared proof
pub fn verify_key_proof(key: &str, project: &Uuid, proof: &str) -> bool {
    key_proof(key, project) == proof
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through() {
        let cipher = PassThrough;
        let sealed = cipher.seal("hello").unwrap();
        assert_eq!(sealed, "hello");
        assert_eq!(cipher.open(&sealed).unwrap(), "hello");
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn test_key_proof() {
        let project = Uuid::new_v4();
        let key = generate_key();
        let proof = key_proof(&key, &project);

        assert!(verify_key_proof(&key, &project, &proof));
        assert!(!verify_key_proof("wrong", &project, &proof));
        assert!(!verify_key_proof(&key, &Uuid::new_v4(), &proof));
        assert!(!proof.contains(&key));
    }
}
