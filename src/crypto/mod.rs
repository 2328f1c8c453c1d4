//! DCS Protocol - Security Layer
//!
//! Payloads are encrypted with XTEA in CBC mode under a per-device 128-bit
//! key. Every non-empty plaintext starts with 8 random bytes, so the first
//! ciphertext block is randomized independently of the IV.
//!
//! - [`CryptoKey`]: key parsing from the configured hex string
//! - [`Xtea`]: block function and CBC chaining

mod keys;
mod xtea;

pub use keys::{random_block, CryptoKey};
pub use xtea::Xtea;
