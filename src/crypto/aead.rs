//! AEAD encryption/decryption of tunnel messages
//!
//! Every message is sealed with AES-256-GCM under the key derived from the
//! shared token. A fresh random nonce is generated per call and travels in
//! front of the ciphertext:
//!
//! ```text
//! +-------------+---------------------+----------+
//! | Nonce (12B) |     Ciphertext      | Tag (16B)|
//! +-------------+---------------------+----------+
//! ```

use super::{derive_key, CryptoError, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

/// AEAD cipher bound to one tunnel token
pub struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Cipher {
    /// Create a cipher keyed with SHA-256 of `token`
    pub fn new(token: &str) -> Result<Self, CryptoError> {
        let unbound_key = UnboundKey::new(&AES_256_GCM, &derive_key(token))
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CryptoError::Rng)?;

        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut out[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        out.extend_from_slice(tag.as_ref());

        Ok(out)
    }

    /// Decrypt a frame produced by [`Cipher::encrypt`]
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&frame[..NONCE_LEN]);

        let mut buffer = frame[NONCE_LEN..].to_vec();
        let plaintext_len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| CryptoError::DecryptionFailed)?
            .len();

        buffer.truncate(plaintext_len);
        Ok(buffer)
    }
}

/// Encrypt `plaintext` under the key derived from `token`
pub fn encrypt(token: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Cipher::new(token)?.encrypt(plaintext)
}

/// Decrypt `ciphertext` under the key derived from `token`
pub fn decrypt(token: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Cipher::new(token)?.decrypt(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_encrypt_decrypt() {
        let cipher = Cipher::new("shared-token").unwrap();

        let plaintext = b"Hello, World!";
        let ciphertext = cipher.encrypt(plaintext).unwrap();
        let decrypted = cipher.decrypt(&ciphertext).unwrap();

        assert_eq!(&decrypted, plaintext);
        assert_eq!(ciphertext.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
        assert_ne!(&ciphertext[NONCE_LEN..NONCE_LEN + plaintext.len()], plaintext);
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        let token = "token";
        for len in [0usize, 1, 15, 16, 17, 1024, 70_000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ciphertext = encrypt(token, &plaintext).unwrap();
            assert_eq!(decrypt(token, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let cipher = Cipher::new("token").unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key() {
        let ciphertext = encrypt("token-a", b"secret").unwrap();
        assert!(matches!(
            decrypt("token-b", &ciphertext),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_input() {
        let cipher = Cipher::new("token").unwrap();
        assert!(cipher.decrypt(&[]).is_err());
        assert!(cipher.decrypt(&[0u8; NONCE_LEN - 1]).is_err());
        assert!(cipher.decrypt(&[0u8; NONCE_LEN]).is_err());

        let ciphertext = cipher.encrypt(b"payload").unwrap();
        assert!(cipher.decrypt(&ciphertext[..ciphertext.len() - 1]).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = Cipher::new("token").unwrap();
        let mut ciphertext = cipher.encrypt(b"Hello, World!").unwrap();

        // Tamper with ciphertext
        ciphertext[NONCE_LEN] ^= 0xFF;

        assert!(cipher.decrypt(&ciphertext).is_err());
    }
}
