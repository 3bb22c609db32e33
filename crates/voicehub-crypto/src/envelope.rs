//! AES-256-CBC envelope encryption for control-plane frames.
//!
//! Wire shape: `IV(16) || ciphertext`, PKCS#7 padded, fresh random IV
//! per frame. Each frame carries its own IV, so frames decrypt
//! independently and in any order.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{CryptoError, IV_LEN, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt a plaintext under `key`, returning `IV || ciphertext`.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Decrypt `IV || ciphertext` under `key`.
///
/// Fails on blobs shorter than one IV, on ciphertexts that are not a
/// whole number of blocks, and on bad padding.
pub fn open(blob: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < IV_LEN {
        return Err(CryptoError::TruncatedCiphertext(blob.len()));
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);

    Aes256CbcDec::new(key.into(), GenericArray::from_slice(iv))
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}
