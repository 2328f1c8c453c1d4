//! XTEA block cipher in CBC mode
//!
//! The cloud uses XTEA (64-bit block, 128-bit key, 32 cycles) with key and
//! block words in big-endian order, chained in CBC mode. Plaintext is never
//! padded here; callers hand in whole blocks.

use zeroize::Zeroize;

use super::keys::CryptoKey;
use crate::core::{CryptoError, BLOCK_SIZE};

/// Key schedule constant.
const DELTA: u32 = 0x9E37_79B9;

/// Feistel cycles (64 rounds).
const CYCLES: u32 = 32;

/// An XTEA cipher instance bound to one key.
///
/// Key words are zeroized on drop.
#[derive(Clone)]
pub struct Xtea {
    key: [u32; 4],
}

impl Xtea {
    /// Create a cipher for the given key.
    pub fn new(key: &CryptoKey) -> Self {
        let bytes = key.as_bytes();
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { key: words }
    }

    /// Encrypt a single block.
    pub fn encrypt_block(&self, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let (mut v0, mut v1) = split(block);
        let mut sum: u32 = 0;
        for _ in 0..CYCLES {
            v0 = v0.wrapping_add(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                    ^ sum.wrapping_add(self.key[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ sum.wrapping_add(self.key[((sum >> 11) & 3) as usize]),
            );
        }
        join(v0, v1)
    }

    /// Decrypt a single block.
    pub fn decrypt_block(&self, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let (mut v0, mut v1) = split(block);
        let mut sum: u32 = DELTA.wrapping_mul(CYCLES);
        for _ in 0..CYCLES {
            v1 = v1.wrapping_sub(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ sum.wrapping_add(self.key[((sum >> 11) & 3) as usize]),
            );
            sum = sum.wrapping_sub(DELTA);
            v0 = v0.wrapping_sub(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                    ^ sum.wrapping_add(self.key[(sum & 3) as usize]),
            );
        }
        join(v0, v1)
    }

    /// Encrypt whole blocks in CBC mode.
    pub fn cbc_encrypt(&self, iv: [u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_aligned(data)?;
        let mut out = Vec::with_capacity(data.len());
        let mut chain = iv;
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            for (b, (p, c)) in block.iter_mut().zip(chunk.iter().zip(chain.iter())) {
                *b = p ^ c;
            }
            chain = self.encrypt_block(block);
            out.extend_from_slice(&chain);
        }
        Ok(out)
    }

    /// Decrypt whole blocks in CBC mode.
    pub fn cbc_decrypt(&self, iv: [u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_aligned(data)?;
        let mut out = Vec::with_capacity(data.len());
        let mut chain = iv;
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            let mut cipher_block = [0u8; BLOCK_SIZE];
            cipher_block.copy_from_slice(chunk);
            let plain = self.decrypt_block(cipher_block);
            out.extend(plain.iter().zip(chain.iter()).map(|(p, c)| p ^ c));
            chain = cipher_block;
        }
        Ok(out)
    }
}

impl Drop for Xtea {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn check_aligned(data: &[u8]) -> Result<(), CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedInput(data.len()));
    }
    Ok(())
}

fn split(block: [u8; BLOCK_SIZE]) -> (u32, u32) {
    (
        u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
    )
}

fn join(v0: u32, v1: u32) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..4].copy_from_slice(&v0.to_be_bytes());
    block[4..].copy_from_slice(&v1.to_be_bytes());
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential_key() -> CryptoKey {
        let mut key = [0u8; 16];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        CryptoKey::from_bytes(key)
    }

    #[test]
    fn test_known_answer_vectors() {
        let cipher = Xtea::new(&sequential_key());
        assert_eq!(
            cipher.encrypt_block(*b"ABCDEFGH"),
            [0x49, 0x7d, 0xf3, 0xd0, 0x72, 0x61, 0x2c, 0xb5]
        );
        assert_eq!(
            cipher.encrypt_block(*b"AAAAAAAA"),
            [0xe7, 0x8f, 0x2d, 0x13, 0x74, 0x43, 0x41, 0xd8]
        );

        let zero = Xtea::new(&CryptoKey::from_bytes([0u8; 16]));
        assert_eq!(
            zero.encrypt_block(*b"ABCDEFGH"),
            [0xa0, 0x39, 0x05, 0x89, 0xf8, 0xb8, 0xef, 0xa5]
        );
    }

    #[test]
    fn test_block_decrypt_inverts_encrypt() {
        let cipher = Xtea::new(&sequential_key());
        let block = [0x5a, 0x5b, 0x6e, 0x27, 0x89, 0x48, 0xd7, 0x7f];
        assert_eq!(cipher.decrypt_block(cipher.encrypt_block(block)), block);
    }

    #[test]
    fn test_cbc_chains_blocks() {
        let cipher = Xtea::new(&sequential_key());
        let iv = [7u8; BLOCK_SIZE];
        let plain = [0x11u8; 16];

        let encrypted = cipher.cbc_encrypt(iv, &plain).unwrap();
        assert_eq!(encrypted.len(), 16);
        // identical plaintext blocks must not yield identical ciphertext blocks
        assert_ne!(encrypted[..8], encrypted[8..]);

        assert_eq!(cipher.cbc_decrypt(iv, &encrypted).unwrap(), plain);
    }

    #[test]
    fn test_cbc_wrong_iv_only_garbles_first_block() {
        let cipher = Xtea::new(&sequential_key());
        let plain = *b"vectorXXpayload!";
        let encrypted = cipher.cbc_encrypt([1u8; BLOCK_SIZE], &plain).unwrap();

        let decrypted = cipher.cbc_decrypt([2u8; BLOCK_SIZE], &encrypted).unwrap();
        assert_ne!(decrypted[..8], plain[..8]);
        assert_eq!(decrypted[8..], plain[8..]);
    }

    #[test]
    fn test_cbc_rejects_unaligned_input() {
        let cipher = Xtea::new(&sequential_key());
        assert_eq!(
            cipher.cbc_encrypt([0u8; BLOCK_SIZE], &[1, 2, 3]),
            Err(CryptoError::UnalignedInput(3))
        );
        assert_eq!(
            cipher.cbc_decrypt([0u8; BLOCK_SIZE], &[0u8; 9]),
            Err(CryptoError::UnalignedInput(9))
        );
    }

    #[test]
    fn test_empty_input() {
        let cipher = Xtea::new(&sequential_key());
        assert!(cipher.cbc_encrypt([0u8; BLOCK_SIZE], &[]).unwrap().is_empty());
    }
}
