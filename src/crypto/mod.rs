//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - AES-256-GCM authenticated encryption of whole tunnel messages
//! - Key derivation from the shared tunnel token (SHA-256)

mod aead;

pub use aead::{decrypt, encrypt, Cipher};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Random number generation failed")]
    Rng,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Derive the symmetric key used by every node sharing `token`
pub fn derive_key(token: &str) -> [u8; KEY_LEN] {
    let digest = ring::digest::digest(&ring::digest::SHA256, token.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest.as_ref());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_sha256() {
        // SHA-256("abc")
        let key = derive_key("abc");
        assert_eq!(key[..4], [0xba, 0x78, 0x16, 0xbf]);
        assert_eq!(derive_key("abc"), key);
        assert_ne!(derive_key("abd"), key);
    }
}
