//! voicehub cryptographic primitives.
//!
//! This crate provides:
//! - Password hashing (unsalted SHA-256, matching the wire format)
//! - Random session tokens and symmetric keys
//! - AES-256-CBC envelope encryption for control frames
//! - AES-256-CTR for counter-addressed voice frames
//!
//! Keys are always exactly 32 bytes, enforced by type.

pub mod counter;
pub mod envelope;
pub mod password;

pub use counter::counter_crypt;
pub use envelope::{open, seal};
pub use password::{hash_password, verify_password_hash};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Symmetric key length (AES-256).
pub const KEY_LEN: usize = 32;

/// AES block / IV length.
pub const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext too short: {0} bytes (need at least 16 for the IV)")]
    TruncatedCiphertext(usize),

    #[error("decryption failed: wrong key or corrupted frame")]
    DecryptFailed,
}

/// Generate `n` cryptographically strong random bytes.
pub fn generate_token(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a fresh 32-byte symmetric key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}
