//! Canonical state hashing for desync detection.
//!
//! Both peers hash every *confirmed* frame's simulator state and exchange
//! the digests over the data channel. For the comparison to be meaningful
//! the digest must be reproducible across runtimes, so hashing follows a
//! strict recipe:
//!
//! 1. Serialize the state to a JSON value.
//! 2. Normalize every float to 10 decimal places (different platforms
//!    format the tail digits of binary floats differently).
//! 3. Serialize canonically: sorted keys, compact separators (`serde_json`
//!    defaults).
//! 4. SHA-256, truncated to the first 8 bytes (16 hex characters).
//!
//! Changing any of these steps silently breaks cross-peer parity.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Frame;

/// Number of decimal places floats are rounded to before serialization.
const FLOAT_DECIMALS: f64 = 1e10;

/// Confirmed-frame hashes retained per session.
pub const HASH_HISTORY_CAP: usize = 120;

/// A 16-hex-character digest of a confirmed simulator state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StateHash([u8; 8]);

impl StateHash {
    /// Builds a hash from its 8 raw bytes (the wire representation).
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        StateHash(bytes)
    }

    /// The 8 raw bytes, as sent in state-hash packets.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors raised while hashing a state.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The state could not be represented as JSON.
    #[error("state is not JSON-serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Rounds every float in the value tree to 10 decimal places, in place.
///
/// Integers and non-numeric values pass through untouched. Floats that are
/// whole numbers stay floats (`1.0` serializes as `1.0`, not `1`), so the
/// canonical text is stable regardless of how a runtime arrived at the
/// value.
pub fn normalize_floats(value: &mut Value) {
    match value {
        Value::Number(n) => {
            // Integer-backed numbers already serialize canonically.
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    let rounded = (f * FLOAT_DECIMALS).round() / FLOAT_DECIMALS;
                    if let Some(num) = serde_json::Number::from_f64(rounded) {
                        *value = Value::Number(num);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_floats(item);
            }
        }
        Value::Object(fields) => {
            for (_, field) in fields.iter_mut() {
                normalize_floats(field);
            }
        }
        _ => {}
    }
}

/// Hashes a serializable state with the canonical recipe.
///
/// # Errors
/// Returns [`HashError::Serialize`] if the state cannot be represented as
/// JSON (e.g. a NaN float).
pub fn hash_state<S: Serialize>(state: &S) -> Result<StateHash, HashError> {
    let mut value = serde_json::to_value(state)?;
    normalize_floats(&mut value);
    // serde_json's default map is sorted and `to_string` is compact, which
    // together give the canonical form.
    let canonical = serde_json::to_string(&value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    Ok(StateHash(bytes))
}

/// Bounded map of confirmed-frame hashes.
///
/// Insertion evicts the oldest entries beyond [`HASH_HISTORY_CAP`];
/// rollback invalidates everything at or past the target frame so the
/// hashes are recomputed on the next confirmation pass.
#[derive(Debug, Default)]
pub struct HashHistory {
    entries: BTreeMap<Frame, StateHash>,
}

impl HashHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the hash for a confirmed frame, evicting the oldest entry
    /// when the cap is exceeded.
    pub fn insert(&mut self, frame: Frame, hash: StateHash) {
        self.entries.insert(frame, hash);
        while self.entries.len() > HASH_HISTORY_CAP {
            if let Some(oldest) = self.entries.keys().next().copied() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Returns the recorded hash for `frame`, if still retained.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<StateHash> {
        self.entries.get(&frame).copied()
    }

    /// Drops every hash with `frame >= target` (rollback invalidation).
    pub fn invalidate_from(&mut self, target: Frame) {
        self.entries.retain(|&frame, _| frame < target);
    }

    /// Removes and returns the hash for a single frame.
    pub fn remove(&mut self, frame: Frame) -> Option<StateHash> {
        self.entries.remove(&frame)
    }

    /// Number of retained hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clears the history for the next episode.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates retained `(frame, hash)` pairs in frame order.
    pub fn iter(&self) -> impl Iterator<Item = (Frame, StateHash)> + '_ {
        self.entries.iter().map(|(f, h)| (*f, *h))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_is_sixteen_hex_chars() {
        let hash = hash_state(&json!({"a": 1})).unwrap();
        let text = hash.to_string();
        assert_eq!(text.len(), 16);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_is_stable_across_key_insertion_order() {
        let a = json!({"x": 1, "y": [1.5, 2.5], "z": {"nested": true}});
        let b = json!({"z": {"nested": true}, "y": [1.5, 2.5], "x": 1});
        assert_eq!(hash_state(&a).unwrap(), hash_state(&b).unwrap());
    }

    #[test]
    fn float_tail_noise_is_normalized_away() {
        // Differences past the 10th decimal place must not affect the hash.
        let a = json!({"pos": 0.1234567890123});
        let b = json!({"pos": 0.1234567890456});
        assert_eq!(hash_state(&a).unwrap(), hash_state(&b).unwrap());

        // Differences within 10 decimals must.
        let c = json!({"pos": 0.1234567891});
        assert_ne!(hash_state(&a).unwrap(), hash_state(&c).unwrap());
    }

    #[test]
    fn integers_are_untouched() {
        let mut v = json!({"count": 3, "big": 9_007_199_254_740_993i64});
        let original = v.clone();
        normalize_floats(&mut v);
        assert_eq!(v, original);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = HashHistory::new();
        let hash = StateHash::from_bytes([0; 8]);
        for f in 0..200 {
            history.insert(Frame::new(f), hash);
        }
        assert_eq!(history.len(), HASH_HISTORY_CAP);
        assert!(history.get(Frame::new(0)).is_none());
        assert!(history.get(Frame::new(199)).is_some());
    }

    #[test]
    fn invalidation_drops_target_and_later() {
        let mut history = HashHistory::new();
        let hash = StateHash::from_bytes([1; 8]);
        for f in 0..10 {
            history.insert(Frame::new(f), hash);
        }
        history.invalidate_from(Frame::new(6));
        assert!(history.get(Frame::new(5)).is_some());
        assert!(history.get(Frame::new(6)).is_none());
        assert_eq!(history.len(), 6);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        /// Same state, same hash — always.
        #[test]
        fn prop_hash_deterministic(x in any::<i32>(), f in -1e6f64..1e6) {
            let state = json!({"x": x, "f": f});
            prop_assert_eq!(hash_state(&state).unwrap(), hash_state(&state).unwrap());
        }

        /// Semantically equal floats that differ only past the 10th decimal
        /// hash identically. The base value is quantized to 4 decimals so
        /// the noise cannot straddle a rounding boundary of the 10th.
        #[test]
        fn prop_normalization_absorbs_tail_noise(
            n in -10_000_000i64..10_000_000,
            noise in -4e-12f64..4e-12,
        ) {
            let f = n as f64 / 1e4;
            let a = json!({"v": f});
            let b = json!({"v": f + noise});
            prop_assert_eq!(hash_state(&a).unwrap(), hash_state(&b).unwrap());
        }

        /// Canonical serialization is insensitive to map construction order.
        #[test]
        fn prop_key_order_irrelevant(a in any::<i16>(), b in any::<i16>()) {
            let forward = json!({"a": a, "b": b});
            let reverse = json!({"b": b, "a": a});
            prop_assert_eq!(hash_state(&forward).unwrap(), hash_state(&reverse).unwrap());
        }
    }
}
