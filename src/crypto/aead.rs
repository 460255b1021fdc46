//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses ChaCha20-Poly1305 for symmetric encryption with authentication.
//! Envelope nonces are drawn from the OS RNG for every message, so two
//! seals of the same plaintext never share a ciphertext.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(<redacted>)")
    }
}

/// A nonce (number used once) for AEAD operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draw a fresh nonce from the OS RNG.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Create a nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// ChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext with associated authenticated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    ///
    /// # Arguments
    ///
    /// * `nonce` - Must be unique for this key
    /// * `plaintext` - Data to encrypt
    /// * `aad` - Additional data to authenticate (but not encrypt)
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::Crypto)
    }

    /// Decrypt ciphertext with associated authenticated data.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails (wrong key, tampered data, etc.)
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::Crypto)
    }
}

/// Calculate the ciphertext length for a given plaintext length.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        AeadKey::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
            0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
        ])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::random();

        let plaintext = b"Hello, World!";
        let aad = b"context";

        let ciphertext = aead.encrypt(&nonce, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), ciphertext_len(plaintext.len()));

        let decrypted = aead.decrypt(&nonce, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let aead1 = Aead::new(&test_key());
        let aead2 = Aead::new(&AeadKey::from_bytes([0x42u8; KEY_SIZE]));
        let nonce = Nonce::random();

        let ciphertext = aead1.encrypt(&nonce, b"secret data", b"").unwrap();
        assert!(matches!(
            aead2.decrypt(&nonce, &ciphertext, b""),
            Err(Error::Crypto)
        ));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::random();

        let ciphertext = aead.encrypt(&nonce, b"secret data", b"context1").unwrap();
        assert!(aead.decrypt(&nonce, &ciphertext, b"context2").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::random();

        let mut ciphertext = aead.encrypt(&nonce, b"secret data", b"").unwrap();
        ciphertext[0] ^= 0x01; // Flip one bit

        assert!(aead.decrypt(&nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let aead = Aead::new(&test_key());
        let result = aead.decrypt(&Nonce::random(), &[0u8; 4], b"");
        assert!(matches!(
            result,
            Err(Error::Buffer { expected: TAG_SIZE, actual: 4 })
        ));
    }

    #[test]
    fn test_random_nonces_differ() {
        assert_ne!(Nonce::random(), Nonce::random());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let rendered = format!("{:?}", test_key());
        assert_eq!(rendered, "AeadKey(<redacted>)");
    }
}
