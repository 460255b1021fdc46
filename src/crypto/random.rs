//! Randomness for envelope nonces, padding and jitter.
//!
//! Everything draws from the OS RNG; nothing here is seeded or reproducible.

use rand::{CryptoRng, RngCore};
use rand_core::OsRng;

/// OS-backed RNG used for AEAD nonces and OPAQUE.
pub struct SecureRandom;

impl SecureRandom {
    /// Overwrite `dest` with random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// A fresh nonce-sized (or any `N`) random array.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut out = [0u8; N];
        Self::fill(&mut out);
        out
    }

    /// Raw 64-bit draw behind random pad lengths.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Handle for APIs that take an `RngCore + CryptoRng`, such as opaque-ke.
    pub fn rng() -> impl RngCore + CryptoRng {
        OsRng
    }
}

/// `len` bytes of filler appended after a framed payload.
pub fn random_padding(len: usize) -> Vec<u8> {
    let mut padding = vec![0u8; len];
    SecureRandom::fill(&mut padding);
    padding
}

/// Uniform value in `0..=max`; modulo bias is negligible at pad sizes.
pub fn random_up_to(max: usize) -> usize {
    let draw = SecureRandom::u64();
    match (max as u64).checked_add(1) {
        Some(bound) => (draw % bound) as usize,
        // `max` spans every u64
        None => draw as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secure_random_fill() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];

        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);

        assert!(!buf1.iter().all(|&b| b == 0));
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_padding() {
        let padding = random_padding(100);
        assert_eq!(padding.len(), 100);
        assert!(!padding.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_random_up_to() {
        assert_eq!(random_up_to(0), 0);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let v = random_up_to(8);
            assert!(v <= 8);
            seen.insert(v);
        }
        assert!(seen.len() > 1);

        // Full range must not overflow the bound
        let _ = random_up_to(usize::MAX);
    }
}
