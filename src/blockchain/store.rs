//! Append-only block log with a parallel hash → height map and the sparse
//! chain locator used for remote catch-up.

use std::collections::HashMap;

use crate::blockchain::block::BlockEntry;
use crate::Hash;

/// The main-chain block log.
#[derive(Default)]
pub struct BlockStore {
    entries: Vec<BlockEntry>,
    by_hash: HashMap<Hash, u64>,
    hashes: Vec<Hash>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks stored (tip height + 1).
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hash of the chain tip. Empty store has no tail.
    pub fn tail_id(&self) -> Option<Hash> {
        self.hashes.last().copied()
    }

    pub fn last(&self) -> Option<&BlockEntry> {
        self.entries.last()
    }

    pub fn get(&self, height: u64) -> Option<&BlockEntry> {
        self.entries.get(height as usize)
    }

    pub fn get_mut(&mut self, height: u64) -> Option<&mut BlockEntry> {
        self.entries.get_mut(height as usize)
    }

    pub fn hash_of(&self, height: u64) -> Option<Hash> {
        self.hashes.get(height as usize).copied()
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Append an entry at the tip.
    pub fn push(&mut self, entry: BlockEntry, hash: Hash) {
        debug_assert_eq!(entry.height, self.len());
        self.by_hash.insert(hash, entry.height);
        self.hashes.push(hash);
        self.entries.push(entry);
        debug_assert_eq!(self.hashes.len(), self.entries.len());
    }

    /// Remove and return the tip entry.
    pub fn pop_last(&mut self) -> Option<(BlockEntry, Hash)> {
        let entry = self.entries.pop()?;
        let hash = self.hashes.pop().expect("hashes tracks entries");
        self.by_hash.remove(&hash);
        Some((entry, hash))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockEntry> {
        self.entries.iter()
    }

    /// Locator with doubling back-offsets: `[tail, tail-1, tail-2, tail-4,
    /// …, genesis]`.
    pub fn build_sparse_chain(&self) -> Vec<Hash> {
        self.build_sparse_chain_from(self.len().saturating_sub(1))
    }

    /// Sparse chain starting from an arbitrary height down to genesis.
    pub fn build_sparse_chain_from(&self, start_height: u64) -> Vec<Hash> {
        if self.is_empty() {
            return Vec::new();
        }
        let start = start_height.min(self.len() - 1);
        let mut ids = Vec::new();
        let mut offset = 1u64;
        let mut remaining = start + 1;
        while remaining > 0 {
            ids.push(self.hashes[(remaining - 1) as usize]);
            if remaining <= offset {
                break;
            }
            remaining -= offset;
            offset *= 2;
        }
        if *ids.last().expect("non-empty") != self.hashes[0] {
            ids.push(self.hashes[0]);
        }
        ids
    }

    /// Height of the highest locator entry present in this chain. The
    /// locator is ordered tip-first, so the first known id wins; genesis is
    /// guaranteed present for a compatible peer.
    pub fn find_supplement(&self, locator: &[Hash]) -> Option<u64> {
        locator.iter().find_map(|id| self.height_of(id))
    }

    /// Timestamps of up to `count` blocks ending at the tip.
    pub fn last_timestamps(&self, count: usize) -> Vec<u64> {
        let start = self.entries.len().saturating_sub(count);
        self.entries[start..]
            .iter()
            .map(|e| e.block.timestamp)
            .collect()
    }

    /// Block sizes of up to `count` blocks ending at the tip.
    pub fn last_block_sizes(&self, count: usize) -> Vec<usize> {
        let start = self.entries.len().saturating_sub(count);
        self.entries[start..]
            .iter()
            .map(|e| e.block_cumulative_size)
            .collect()
    }

    /// `(timestamp, cumulative_difficulty)` samples of the most recent
    /// `count` blocks, oldest first.
    pub fn difficulty_samples(&self, count: usize) -> (Vec<u64>, Vec<u64>) {
        let start = self.entries.len().saturating_sub(count);
        let slice = &self.entries[start..];
        (
            slice.iter().map(|e| e.block.timestamp).collect(),
            slice.iter().map(|e| e.cumulative_difficulty).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{
        BaseInput, Block, BlockEntry, Transaction, TransactionInput, TransactionPrefix,
    };

    fn entry(height: u64, timestamp: u64) -> (BlockEntry, Hash) {
        let block = Block {
            major_version: 1,
            minor_version: 0,
            timestamp,
            prev_block_hash: [height as u8; 32],
            nonce: height as u32,
            base_transaction: Transaction {
                prefix: TransactionPrefix {
                    version: 1,
                    unlock_time: 0,
                    inputs: vec![TransactionInput::Base(BaseInput {
                        block_index: height,
                    })],
                    outputs: vec![],
                    extra: vec![],
                },
                signatures: vec![],
            },
            transaction_hashes: vec![],
        };
        let hash = block.hash();
        (
            BlockEntry {
                block,
                height,
                block_cumulative_size: 100,
                cumulative_difficulty: (height + 1) * 10,
                already_generated_coins: 0,
                transactions: vec![],
            },
            hash,
        )
    }

    fn store_of(n: u64) -> BlockStore {
        let mut store = BlockStore::new();
        for h in 0..n {
            let (e, id) = entry(h, 1_000 + h * 120);
            store.push(e, id);
        }
        store
    }

    #[test]
    fn push_pop_roundtrip() {
        let mut store = store_of(3);
        assert_eq!(store.len(), 3);
        let tail = store.tail_id().unwrap();
        assert_eq!(store.height_of(&tail), Some(2));
        let (popped, hash) = store.pop_last().unwrap();
        assert_eq!(popped.height, 2);
        assert_eq!(hash, tail);
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&tail));
    }

    #[test]
    fn sparse_chain_shape() {
        let store = store_of(100);
        let ids = store.build_sparse_chain();
        // Tip first, genesis last, strictly descending heights.
        assert_eq!(ids[0], store.hash_of(99).unwrap());
        assert_eq!(*ids.last().unwrap(), store.hash_of(0).unwrap());
        let heights: Vec<u64> = ids.iter().map(|id| store.height_of(id).unwrap()).collect();
        for w in heights.windows(2) {
            assert!(w[0] > w[1]);
        }
        // Doubling offsets: 99, 98, 96, 92, 84, 68, 36, 0.
        assert_eq!(heights, vec![99, 98, 96, 92, 84, 68, 36, 0]);
    }

    #[test]
    fn sparse_chain_tiny_chains() {
        let store = store_of(1);
        assert_eq!(store.build_sparse_chain().len(), 1);
        let store = store_of(2);
        let ids = store.build_sparse_chain();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], store.hash_of(0).unwrap());
    }

    #[test]
    fn find_supplement_prefers_highest() {
        let store = store_of(50);
        let locator = vec![
            crate::cn_fast_hash(b"unknown"),
            store.hash_of(30).unwrap(),
            store.hash_of(10).unwrap(),
        ];
        assert_eq!(store.find_supplement(&locator), Some(30));
        assert_eq!(store.find_supplement(&[crate::cn_fast_hash(b"x")]), None);
    }

    #[test]
    fn sample_windows_clamp() {
        let store = store_of(5);
        assert_eq!(store.last_timestamps(10).len(), 5);
        assert_eq!(store.last_block_sizes(2).len(), 2);
        let (ts, cd) = store.difficulty_samples(3);
        assert_eq!(ts.len(), 3);
        assert_eq!(cd, vec![30, 40, 50]);
    }
}
