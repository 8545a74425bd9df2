//! Blockchain checkpoints.
//!
//! A height → expected-hash map compiled in from chain history and optionally
//! extended at runtime from an operator-supplied `height:hash` feed. Inside
//! the checkpoint zone proof-of-work is not re-verified; an alternative block
//! below the last checkpoint can never be accepted.

use std::collections::BTreeMap;

use crate::Hash;

/// Compiled-in checkpoint list (`height:hash` entries). The genesis entry is
/// installed at runtime from the generated genesis hash.
pub const EMBEDDED_CHECKPOINTS: &[(u64, &str)] = &[
    (10_000, "7a210e2af485b2865706087d2a6750b46116bffacb94d99c8948f6762fe85267"),
    (50_000, "152a8fe265fc0e769aad8e3d5d7a09a8ec0c5e4061eea01372addada979991c8"),
];

/// Errors from checkpoint list manipulation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("invalid checkpoint hash: {0}")]
    InvalidHash(String),
    #[error("invalid checkpoint entry: {0}")]
    InvalidEntry(String),
    #[error("conflicting checkpoint at height {0}")]
    Conflict(u64),
}

/// Height → expected block hash map.
#[derive(Clone, Debug, Default)]
pub struct Checkpoints {
    points: BTreeMap<u64, Hash>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the mainnet set from the embedded list.
    pub fn with_embedded() -> Result<Self, CheckpointError> {
        let mut cp = Self::new();
        for (height, hash) in EMBEDDED_CHECKPOINTS {
            cp.add_checkpoint(*height, hash)?;
        }
        Ok(cp)
    }

    /// Add a checkpoint from a hex hash. Re-adding the identical hash is a
    /// no-op; a different hash at a known height is a conflict.
    pub fn add_checkpoint(&mut self, height: u64, hash_hex: &str) -> Result<(), CheckpointError> {
        let bytes = hex::decode(hash_hex)
            .map_err(|e| CheckpointError::InvalidHash(e.to_string()))?;
        let hash: Hash = bytes
            .try_into()
            .map_err(|_| CheckpointError::InvalidHash("expected 32 bytes".into()))?;
        self.add_checkpoint_hash(height, hash)
    }

    pub fn add_checkpoint_hash(&mut self, height: u64, hash: Hash) -> Result<(), CheckpointError> {
        match self.points.get(&height) {
            Some(existing) if *existing != hash => Err(CheckpointError::Conflict(height)),
            Some(_) => Ok(()),
            None => {
                self.points.insert(height, hash);
                Ok(())
            }
        }
    }

    /// Merge a refresh feed of `height:hash` lines (the payload format of the
    /// original DNS TXT records). Malformed entries fail the whole batch;
    /// conflicting entries are ignored with a warning, matching the original
    /// trust model where compiled-in points win.
    pub fn add_checkpoint_list(&mut self, feed: &str) -> Result<usize, CheckpointError> {
        let mut added = 0;
        for line in feed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (height, hash) = line
                .split_once(':')
                .ok_or_else(|| CheckpointError::InvalidEntry(line.to_string()))?;
            let height: u64 = height
                .parse()
                .map_err(|_| CheckpointError::InvalidEntry(line.to_string()))?;
            match self.add_checkpoint(height, hash) {
                Ok(()) => added += 1,
                Err(CheckpointError::Conflict(h)) => {
                    tracing::warn!(height = h, "checkpoint feed conflicts with known point");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Whether a height is at or below the highest checkpoint.
    pub fn is_in_checkpoint_zone(&self, height: u64) -> bool {
        self.points
            .last_key_value()
            .map(|(h, _)| height <= *h)
            .unwrap_or(false)
    }

    /// Check a block hash against the checkpoint at `height`, if any.
    /// Returns `(valid, is_a_checkpoint)`.
    pub fn check_block(&self, height: u64, hash: &Hash) -> (bool, bool) {
        match self.points.get(&height) {
            Some(expected) if expected == hash => (true, true),
            Some(expected) => {
                tracing::error!(
                    height,
                    expected = %hex::encode(expected),
                    actual = %hex::encode(hash),
                    "checkpoint failed"
                );
                (false, true)
            }
            None => (true, false),
        }
    }

    /// Whether an alternative block at `block_height` may still be accepted
    /// given the current chain height: it must not fork below the last
    /// checkpoint at or under the current height.
    pub fn is_alternative_block_allowed(&self, blockchain_height: u64, block_height: u64) -> bool {
        if block_height == 0 {
            return false;
        }
        let last_below = self
            .points
            .range(..=blockchain_height)
            .next_back()
            .map(|(h, _)| *h)
            .unwrap_or(0);
        block_height > last_below
    }

    /// Highest checkpointed height at or below `height` whose hash matches
    /// the lookup; used for the startup rollback scan.
    pub fn last_valid_height<F>(&self, tip_height: u64, hash_at: F) -> u64
    where
        F: Fn(u64) -> Option<Hash>,
    {
        let mut last = 0;
        for (&height, expected) in self.points.range(..=tip_height) {
            match hash_at(height) {
                Some(actual) if actual == *expected => last = height,
                _ => break,
            }
        }
        last
    }

    pub fn checkpoint_heights(&self) -> impl Iterator<Item = u64> + '_ {
        self.points.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cn_fast_hash;

    fn cp_with(height: u64, hash: Hash) -> Checkpoints {
        let mut cp = Checkpoints::new();
        cp.add_checkpoint_hash(height, hash).unwrap();
        cp
    }

    #[test]
    fn embedded_list_parses() {
        let cp = Checkpoints::with_embedded().unwrap();
        assert!(cp.is_in_checkpoint_zone(50_000));
        assert!(!cp.is_in_checkpoint_zone(50_001));
    }

    #[test]
    fn check_block_matches() {
        let h = cn_fast_hash(b"block");
        let cp = cp_with(5, h);
        assert_eq!(cp.check_block(5, &h), (true, true));
        assert_eq!(cp.check_block(5, &cn_fast_hash(b"other")), (false, true));
        assert_eq!(cp.check_block(6, &h), (true, false));
    }

    #[test]
    fn conflict_detected() {
        let mut cp = cp_with(5, cn_fast_hash(b"a"));
        assert!(matches!(
            cp.add_checkpoint_hash(5, cn_fast_hash(b"b")),
            Err(CheckpointError::Conflict(5))
        ));
        // Identical re-add is fine.
        cp.add_checkpoint_hash(5, cn_fast_hash(b"a")).unwrap();
    }

    #[test]
    fn alternative_block_gate() {
        let cp = cp_with(100, cn_fast_hash(b"x"));
        // Fork point above the checkpoint: allowed.
        assert!(cp.is_alternative_block_allowed(150, 101));
        // At or below the checkpoint: rejected.
        assert!(!cp.is_alternative_block_allowed(150, 100));
        assert!(!cp.is_alternative_block_allowed(150, 50));
        // Checkpoint not yet reached by the main chain: no restriction.
        assert!(cp.is_alternative_block_allowed(80, 50));
        // Genesis can never be replaced.
        assert!(!cp.is_alternative_block_allowed(80, 0));
    }

    #[test]
    fn feed_parsing() {
        let mut cp = Checkpoints::new();
        let h = hex::encode(cn_fast_hash(b"p"));
        let feed = format!("7:{h}\n9:{h}\n");
        assert_eq!(cp.add_checkpoint_list(&feed).unwrap(), 2);
        assert!(cp.is_in_checkpoint_zone(9));
        assert!(cp.add_checkpoint_list("not-a-line").is_err());
        assert!(cp.add_checkpoint_list("x:y").is_err());
        // A conflicting feed entry is skipped, not fatal.
        let other = hex::encode(cn_fast_hash(b"q"));
        assert_eq!(cp.add_checkpoint_list(&format!("7:{other}")).unwrap(), 0);
    }

    #[test]
    fn last_valid_height_scans_in_order() {
        let h5 = cn_fast_hash(b"5");
        let h9 = cn_fast_hash(b"9");
        let mut cp = Checkpoints::new();
        cp.add_checkpoint_hash(5, h5).unwrap();
        cp.add_checkpoint_hash(9, h9).unwrap();

        // All match.
        let last = cp.last_valid_height(10, |h| match h {
            5 => Some(h5),
            9 => Some(h9),
            _ => None,
        });
        assert_eq!(last, 9);

        // Second point diverged: rollback target is the first.
        let last = cp.last_valid_height(10, |h| match h {
            5 => Some(h5),
            9 => Some(cn_fast_hash(b"fork")),
            _ => None,
        });
        assert_eq!(last, 5);
    }
}
