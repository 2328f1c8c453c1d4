//! Session key handling
//!
//! The cloud assigns every device a 128-bit key, configured as 32 hex digits.

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::core::{CryptoError, BLOCK_SIZE, CRYPTO_KEY_HEX_LEN, CRYPTO_KEY_SIZE};

/// A 16-byte device key.
///
/// Zeroized on drop for security.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey {
    key: [u8; CRYPTO_KEY_SIZE],
}

impl CryptoKey {
    /// Parse a key from its 32-digit hex form.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        if hex_key.len() != CRYPTO_KEY_HEX_LEN {
            return Err(CryptoError::InvalidKeyLength(hex_key.len() / 2));
        }
        let mut raw = hex::decode(hex_key).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; CRYPTO_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Create a key from a byte slice of exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; CRYPTO_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self { key })
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; CRYPTO_KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoKey(<redacted>)")
    }
}

impl Drop for CryptoKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Fresh random material for one cipher block.
pub fn random_block() -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut block);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_hex() {
        let key = CryptoKey::from_hex("41424142414241424142414241424142").unwrap();
        assert_eq!(key.as_bytes(), b"ABABABABABABABAB");
    }

    #[test]
    fn test_key_from_hex_wrong_length() {
        assert_eq!(
            CryptoKey::from_hex("4142"),
            Err(CryptoError::InvalidKeyLength(2))
        );
    }

    #[test]
    fn test_key_from_hex_not_hex() {
        assert_eq!(
            CryptoKey::from_hex("zz424142414241424142414241424142"),
            Err(CryptoError::InvalidKeyEncoding)
        );
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = CryptoKey::from_bytes([0x41; CRYPTO_KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "CryptoKey(<redacted>)");
    }

    #[test]
    fn test_random_blocks_differ() {
        // 2^-64 chance of a false failure
        assert_ne!(random_block(), random_block());
    }
}
