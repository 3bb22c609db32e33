use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hash a password for storage and wire transmission.
///
/// Unsalted SHA-256 of the UTF-8 bytes. This is the scheme the
/// deployed clients send on the wire, so the server must match it
/// byte for byte.
pub fn hash_password(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

/// Recompute and compare a password against a stored hash in
/// constant time. Length mismatches compare unequal.
pub fn verify_password_hash(password: &str, hash: &[u8]) -> bool {
    hash_password(password)[..].ct_eq(hash).into()
}
