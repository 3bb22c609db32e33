//! AES-256-CTR for counter-addressed voice frames.
//!
//! The IV is the sender's 64-bit frame counter written big-endian
//! into bytes 0..8, with bytes 8..16 zero. The zero half leaves
//! 2^64 blocks of keystream per counter value, far beyond any single
//! frame. CTR is an involution: applying it twice with the same
//! `(key, counter)` restores the input.

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::{IV_LEN, KEY_LEN};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Encrypt or decrypt `data` under `key` with the given frame counter.
pub fn counter_crypt(data: &[u8], key: &[u8; KEY_LEN], counter: u64) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    iv[..8].copy_from_slice(&counter.to_be_bytes());

    let mut out = data.to_vec();
    Aes256Ctr::new(key.into(), &iv.into()).apply_keystream(&mut out);
    out
}
