//! Replay detection for opened envelopes.

use std::collections::{HashSet, VecDeque};

use crate::crypto::Nonce;

/// Number of recent nonces remembered by default.
pub const DEFAULT_REPLAY_WINDOW: usize = 4096;

/// Bounded window of recently accepted nonces.
///
/// Nonces are random, so there is no ordering to exploit; the oldest entry
/// is evicted once the window is full.
#[derive(Debug)]
pub struct ReplayGuard {
    seen: HashSet<Nonce>,
    order: VecDeque<Nonce>,
    capacity: usize,
}

impl ReplayGuard {
    /// Create a guard remembering up to `capacity` nonces.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `nonce` was already accepted.
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.seen.contains(nonce)
    }

    /// Remember an accepted nonce. Returns `false` if it was already present.
    pub fn insert(&mut self, nonce: Nonce) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);

        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Number of remembered nonces.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no nonce has been remembered yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(n: u8) -> Nonce {
        Nonce::from_bytes([n; 12])
    }

    #[test]
    fn test_duplicate_detected() {
        let mut guard = ReplayGuard::default();
        assert!(guard.insert(nonce(1)));
        assert!(guard.contains(&nonce(1)));
        assert!(!guard.insert(nonce(1)));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut guard = ReplayGuard::new(3);
        for n in 0..4 {
            assert!(guard.insert(nonce(n)));
        }

        assert_eq!(guard.len(), 3);
        assert!(!guard.contains(&nonce(0)));
        assert!(guard.contains(&nonce(3)));
    }
}
