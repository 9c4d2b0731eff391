//! Client-side envelope encryption.
//!
//! ChaCha20-Poly1305 with a fresh 256-bit key per secret and a fresh 96-bit
//! nonce per encryption. The key travels only in the link fragment; the
//! server only ever sees `Sealed`.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use constant_time_eq::constant_time_eq;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    /// Wrong key, or the ciphertext or nonce was altered.
    #[error("decryption failed: wrong key or tampered ciphertext")]
    Authentication,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("nonce must be {len} bytes, got {0}", len = NONCE_LEN)]
    InvalidNonce(usize),
}

/// A per-secret symmetric key. Wiped from memory on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Ciphertext (tag appended) plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
}

pub fn generate_key() -> SecretKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    SecretKey(key)
}

/// Encrypt `plaintext` under `key` with a freshly drawn nonce.
pub fn encrypt(plaintext: &[u8], key: &SecretKey) -> Result<Sealed, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    Ok(Sealed { ciphertext, iv })
}

/// Decrypt and authenticate. Any mismatch in key, nonce or ciphertext is
/// [`CryptoError::Authentication`].
pub fn decrypt(
    ciphertext: &[u8],
    key: &SecretKey,
    iv: &[u8; NONCE_LEN],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Authentication)
}

/// Lowercase hex, 64 characters.
pub fn export_key(key: &SecretKey) -> String {
    hex::encode(key.0)
}

/// Parse a key exported by [`export_key`]. Either hex case is accepted.
pub fn import_key(encoded: &str) -> Result<SecretKey, CryptoError> {
    if encoded.len() != KEY_LEN * 2 {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} hex characters, got {}",
            KEY_LEN * 2,
            encoded.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    hex::decode_to_slice(encoded, &mut key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(SecretKey(key))
}

/// Length-check a nonce decoded from the wire.
pub fn decode_iv(bytes: &[u8]) -> Result<[u8; NONCE_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidNonce(bytes.len()))
}
