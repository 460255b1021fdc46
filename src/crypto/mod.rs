//! Cryptographic primitives for agentlink.
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD encryption with random per-message nonces
//! - HKDF-SHA256 key derivation for directional envelope keys
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
pub(crate) mod kdf;
pub(crate) mod random;

pub use aead::{Aead, AeadKey, Nonce};
pub use kdf::{DirectionalKeys, Hkdf};
pub use random::SecureRandom;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_and_encrypt_across_directions() {
        let shared = [0x5au8; 64];
        let agent = DirectionalKeys::derive(&shared, b"agent-ctx").unwrap();
        let server = DirectionalKeys::derive(&shared, b"agent-ctx").unwrap();

        let nonce = Nonce::random();
        let aad = b"header";

        // agent -> server
        let ciphertext = Aead::new(agent.upstream())
            .encrypt(&nonce, b"check-in", aad)
            .unwrap();
        let plaintext = Aead::new(server.upstream())
            .decrypt(&nonce, &ciphertext, aad)
            .unwrap();
        assert_eq!(plaintext, b"check-in");

        // A message sealed upstream must not open with the downstream key
        assert!(Aead::new(server.downstream())
            .decrypt(&nonce, &ciphertext, aad)
            .is_err());
    }
}
