//! Deterministic non-cryptographic hashing (FNV-1a).
//!
//! `std`'s default hasher is randomly seeded per process, so it cannot be
//! used anywhere two processes must agree on a digest — or where a digest
//! is compared across snapshots, like the admin aggregator's change
//! fingerprints. This module provides a fixed-seed FNV-1a hasher for those
//! uses. Confirmed-state digests exchanged between peers use the stronger
//! canonical SHA-256 recipe in [`crate::state_hash`] instead.

use std::hash::{Hash, Hasher};

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A deterministic FNV-1a hasher with no random seed.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a hasher at the standard offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Convenience: hashes any `Hash` value with the deterministic hasher.
#[inline]
pub fn fnv1a_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistent_across_calls() {
        assert_eq!(fnv1a_hash(&"snapshot"), fnv1a_hash(&"snapshot"));
        assert_ne!(fnv1a_hash(&"snapshot"), fnv1a_hash(&"snapsh0t"));
    }

    #[test]
    fn known_fnv1a_vectors() {
        let cases: &[(&[u8], u64)] = &[
            (b"", 0xcbf2_9ce4_8422_2325),
            (b"a", 0xaf63_dc4c_8601_ec8c),
            (b"foobar", 0x8594_4171_f739_67e8),
        ];
        for (input, expected) in cases {
            let mut hasher = DeterministicHasher::new();
            hasher.write(input);
            assert_eq!(hasher.finish(), *expected);
        }
    }
}
