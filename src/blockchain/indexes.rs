//! Auxiliary chain indexes maintained alongside the block log.
//!
//! All of them are updated inside block push/pop under the blockchain lock;
//! `multisig_outputs[amount][i].is_used` additionally flips when an input
//! spends the output and must stay consistent under reorgs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::blockchain::block::{
    Transaction, TransactionIndex, TransactionInput, TransactionOutputTarget,
};
use crate::crypto::KeyImage;
use crate::Hash;

/// A multisignature output position with its spent flag.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MultisigOutputUsage {
    pub transaction_index: TransactionIndex,
    pub output_index: u16,
    pub is_used: bool,
}

/// Cumulative deposit totals at one height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTotals {
    pub amount: u64,
    pub interest: u64,
}

/// Cumulative deposit index: one entry per block, prefix sums of locked
/// deposit amount and accrued interest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DepositIndex {
    totals: Vec<DepositTotals>,
}

impl DepositIndex {
    /// Record a block's deposit delta (new deposits minus withdrawals) and
    /// the interest it paid out.
    pub fn push_block(&mut self, deposit_delta: i64, interest: u64) {
        let last = self.totals.last().copied().unwrap_or_default();
        let amount = if deposit_delta >= 0 {
            last.amount.saturating_add(deposit_delta as u64)
        } else {
            last.amount.saturating_sub(deposit_delta.unsigned_abs())
        };
        self.totals.push(DepositTotals {
            amount,
            interest: last.interest.saturating_add(interest),
        });
    }

    pub fn pop_block(&mut self) {
        self.totals.pop();
    }

    /// Currently locked deposit amount at the tip.
    pub fn full_deposit_amount(&self) -> u64 {
        self.totals.last().map(|t| t.amount).unwrap_or(0)
    }

    pub fn deposit_amount_at_height(&self, height: u64) -> u64 {
        self.totals
            .get(height as usize)
            .map(|t| t.amount)
            .unwrap_or(0)
    }

    pub fn deposit_interest_at_height(&self, height: u64) -> u64 {
        self.totals
            .get(height as usize)
            .map(|t| t.interest)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

/// Every secondary index the engine maintains.
#[derive(Default)]
pub struct ChainIndexes {
    /// Key image → height of the block that spent it.
    pub spent_key_images: HashMap<KeyImage, u64>,
    /// Transaction hash → position in the block log.
    pub transaction_map: HashMap<Hash, TransactionIndex>,
    /// Amount → ordered key outputs; position is the global output index.
    pub outputs_by_amount: HashMap<u64, Vec<(TransactionIndex, u16)>>,
    /// Amount → ordered multisignature outputs with used flags.
    pub multisig_outputs: HashMap<u64, Vec<MultisigOutputUsage>>,
    /// Payment id → transaction hashes carrying it.
    pub payment_id_index: HashMap<Hash, Vec<Hash>>,
    /// Block timestamp → block hashes.
    pub timestamp_index: BTreeMap<u64, Vec<Hash>>,
    /// Height → alternative block hashes rooted there.
    pub orphan_index: HashMap<u64, Vec<Hash>>,
    /// Cumulative deposit totals per height.
    pub deposit_index: DepositIndex,
    /// Cumulative transaction count per height.
    pub generated_transactions: Vec<u64>,
}

/// Why a transaction could not be indexed.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate transaction in index")]
    DuplicateTransaction,
    #[error("key image already spent")]
    DoubleSpend,
    #[error("multisignature input duplicated within transaction")]
    MultisigDuplicate,
    #[error("multisignature output reference out of range")]
    MultisigOutOfRange,
}

impl ChainIndexes {
    /// Index a transaction's inputs and outputs at `tx_index`.
    ///
    /// Marks referenced multisignature outputs used, claims key images, and
    /// assigns global indexes to each output. On failure every partial
    /// mutation is rolled back.
    pub fn push_transaction(
        &mut self,
        tx: &Transaction,
        tx_hash: Hash,
        tx_index: TransactionIndex,
        height: u64,
    ) -> Result<Vec<u32>, IndexError> {
        if self.transaction_map.contains_key(&tx_hash) {
            return Err(IndexError::DuplicateTransaction);
        }
        if !multisig_inputs_distinct(tx) {
            return Err(IndexError::MultisigDuplicate);
        }
        self.transaction_map.insert(tx_hash, tx_index);

        // Claim key images, unwinding on a double spend.
        let mut claimed: Vec<KeyImage> = Vec::new();
        for input in &tx.prefix.inputs {
            if let TransactionInput::Key(key_input) = input {
                if self
                    .spent_key_images
                    .insert(key_input.key_image, height)
                    .is_some()
                {
                    for image in &claimed {
                        self.spent_key_images.remove(image);
                    }
                    self.transaction_map.remove(&tx_hash);
                    return Err(IndexError::DoubleSpend);
                }
                claimed.push(key_input.key_image);
            }
        }

        // Flip used flags on referenced multisignature outputs.
        for input in &tx.prefix.inputs {
            if let TransactionInput::Multisignature(m) = input {
                let outputs = self.multisig_outputs.entry(m.amount).or_default();
                match outputs.get_mut(m.output_index as usize) {
                    Some(usage) => usage.is_used = true,
                    None => {
                        for image in &claimed {
                            self.spent_key_images.remove(image);
                        }
                        self.transaction_map.remove(&tx_hash);
                        return Err(IndexError::MultisigOutOfRange);
                    }
                }
            }
        }

        // Assign global output indexes.
        let mut global_indexes = Vec::with_capacity(tx.prefix.outputs.len());
        for (output_index, output) in tx.prefix.outputs.iter().enumerate() {
            match &output.target {
                TransactionOutputTarget::Key(_) => {
                    let outputs = self.outputs_by_amount.entry(output.amount).or_default();
                    global_indexes.push(outputs.len() as u32);
                    outputs.push((tx_index, output_index as u16));
                }
                TransactionOutputTarget::Multisignature(_) => {
                    let outputs = self.multisig_outputs.entry(output.amount).or_default();
                    global_indexes.push(outputs.len() as u32);
                    outputs.push(MultisigOutputUsage {
                        transaction_index: tx_index,
                        output_index: output_index as u16,
                        is_used: false,
                    });
                }
            }
        }

        if let Some(payment_id) = tx.payment_id() {
            self.payment_id_index
                .entry(payment_id)
                .or_default()
                .push(tx_hash);
        }

        Ok(global_indexes)
    }

    /// Undo `push_transaction`. Outputs are removed back-to-front so the
    /// global index tails stay consistent.
    pub fn pop_transaction(&mut self, tx: &Transaction, tx_hash: &Hash) {
        let tx_index = match self.transaction_map.remove(tx_hash) {
            Some(index) => index,
            None => {
                tracing::error!(tx = %hex::encode(&tx_hash[..8]), "pop of unindexed transaction");
                return;
            }
        };

        for (output_index, output) in tx.prefix.outputs.iter().enumerate().rev() {
            match &output.target {
                TransactionOutputTarget::Key(_) => {
                    let consistent = match self.outputs_by_amount.get_mut(&output.amount) {
                        Some(outputs) => match outputs.last() {
                            Some((last_index, last_output)) => {
                                let ok = *last_index == tx_index
                                    && *last_output == output_index as u16;
                                if ok {
                                    outputs.pop();
                                }
                                if outputs.is_empty() {
                                    self.outputs_by_amount.remove(&output.amount);
                                }
                                ok
                            }
                            None => false,
                        },
                        None => false,
                    };
                    if !consistent {
                        tracing::error!(amount = output.amount, "output index inconsistent during pop");
                    }
                }
                TransactionOutputTarget::Multisignature(_) => {
                    if let Some(outputs) = self.multisig_outputs.get_mut(&output.amount) {
                        outputs.pop();
                        if outputs.is_empty() {
                            self.multisig_outputs.remove(&output.amount);
                        }
                    }
                }
            }
        }

        for input in &tx.prefix.inputs {
            match input {
                TransactionInput::Key(key_input) => {
                    self.spent_key_images.remove(&key_input.key_image);
                }
                TransactionInput::Multisignature(m) => {
                    if let Some(outputs) = self.multisig_outputs.get_mut(&m.amount) {
                        if let Some(usage) = outputs.get_mut(m.output_index as usize) {
                            usage.is_used = false;
                        }
                    }
                }
                TransactionInput::Base(_) => {}
            }
        }

        if let Some(payment_id) = tx.payment_id() {
            if let Some(hashes) = self.payment_id_index.get_mut(&payment_id) {
                hashes.retain(|h| h != tx_hash);
                if hashes.is_empty() {
                    self.payment_id_index.remove(&payment_id);
                }
            }
        }
    }

    pub fn is_key_image_spent(&self, image: &KeyImage) -> bool {
        self.spent_key_images.contains_key(image)
    }

    pub fn add_block_timestamp(&mut self, timestamp: u64, hash: Hash) {
        self.timestamp_index.entry(timestamp).or_default().push(hash);
    }

    pub fn remove_block_timestamp(&mut self, timestamp: u64, hash: &Hash) {
        if let Some(hashes) = self.timestamp_index.get_mut(&timestamp) {
            hashes.retain(|h| h != hash);
            if hashes.is_empty() {
                self.timestamp_index.remove(&timestamp);
            }
        }
    }

    /// Block hashes whose timestamps fall in `[begin, end]`, up to `limit`.
    pub fn blocks_by_timestamp(&self, begin: u64, end: u64, limit: usize) -> Vec<Hash> {
        self.timestamp_index
            .range(begin..=end)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .take(limit)
            .collect()
    }

    pub fn transactions_by_payment_id(&self, payment_id: &Hash) -> Vec<Hash> {
        self.payment_id_index
            .get(payment_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_generated_transactions(&mut self, count_in_block: u64) {
        let last = self.generated_transactions.last().copied().unwrap_or(0);
        self.generated_transactions.push(last + count_in_block);
    }

    pub fn pop_generated_transactions(&mut self) {
        self.generated_transactions.pop();
    }

    pub fn total_transactions(&self) -> u64 {
        self.generated_transactions.last().copied().unwrap_or(0)
    }
}

/// A transaction may not reference the same multisignature output twice.
fn multisig_inputs_distinct(tx: &Transaction) -> bool {
    let mut seen = std::collections::HashSet::new();
    for input in &tx.prefix.inputs {
        if let TransactionInput::Multisignature(m) = input {
            if !seen.insert((m.amount, m.output_index)) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{
        KeyInput, KeyOutput, MultisignatureInput, MultisignatureOutput, TransactionOutput,
        TransactionPrefix,
    };
    use crate::crypto::PublicKey;

    fn key_spend_tx(image: u8, amount: u64) -> Transaction {
        Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: 0,
                inputs: vec![TransactionInput::Key(KeyInput {
                    amount,
                    output_indexes: vec![0],
                    key_image: KeyImage([image; 32]),
                })],
                outputs: vec![TransactionOutput {
                    amount,
                    target: TransactionOutputTarget::Key(KeyOutput {
                        key: PublicKey([image; 32]),
                    }),
                }],
                extra: vec![],
            },
            signatures: vec![vec![]],
        }
    }

    fn deposit_tx(amount: u64, term: u32) -> Transaction {
        Transaction {
            prefix: TransactionPrefix {
                version: 2,
                unlock_time: 0,
                inputs: vec![],
                outputs: vec![TransactionOutput {
                    amount,
                    target: TransactionOutputTarget::Multisignature(MultisignatureOutput {
                        keys: vec![PublicKey([1u8; 32])],
                        required_signatures: 1,
                        term,
                    }),
                }],
                extra: vec![],
            },
            signatures: vec![],
        }
    }

    fn at(block: u32, transaction: u16) -> TransactionIndex {
        TransactionIndex { block, transaction }
    }

    #[test]
    fn push_assigns_monotonic_global_indexes() {
        let mut idx = ChainIndexes::default();
        let tx1 = key_spend_tx(1, 50);
        let tx2 = key_spend_tx(2, 50);
        let g1 = idx.push_transaction(&tx1, tx1.hash(), at(0, 0), 0).unwrap();
        let g2 = idx.push_transaction(&tx2, tx2.hash(), at(1, 0), 1).unwrap();
        assert_eq!(g1, vec![0]);
        assert_eq!(g2, vec![1]);
        assert!(idx.is_key_image_spent(&KeyImage([1u8; 32])));
    }

    #[test]
    fn double_spend_rejected_and_rolled_back() {
        let mut idx = ChainIndexes::default();
        let tx1 = key_spend_tx(7, 50);
        idx.push_transaction(&tx1, tx1.hash(), at(0, 0), 0).unwrap();
        let tx2 = {
            // Different hash, same key image.
            let mut tx = key_spend_tx(7, 50);
            tx.prefix.unlock_time = 99;
            tx
        };
        let err = idx
            .push_transaction(&tx2, tx2.hash(), at(1, 0), 1)
            .unwrap_err();
        assert_eq!(err, IndexError::DoubleSpend);
        // The failed push left no trace.
        assert!(!idx.transaction_map.contains_key(&tx2.hash()));
        assert_eq!(idx.outputs_by_amount.get(&50).unwrap().len(), 1);
    }

    #[test]
    fn pop_restores_indexes() {
        let mut idx = ChainIndexes::default();
        let tx = key_spend_tx(3, 75);
        let hash = tx.hash();
        idx.push_transaction(&tx, hash, at(0, 0), 0).unwrap();
        idx.pop_transaction(&tx, &hash);
        assert!(idx.spent_key_images.is_empty());
        assert!(idx.outputs_by_amount.is_empty());
        assert!(idx.transaction_map.is_empty());
    }

    #[test]
    fn multisig_spend_flips_used_flag_both_ways() {
        let mut idx = ChainIndexes::default();
        let deposit = deposit_tx(1_000_000, 21_900);
        let deposit_hash = deposit.hash();
        let globals = idx
            .push_transaction(&deposit, deposit_hash, at(0, 1), 0)
            .unwrap();
        assert_eq!(globals, vec![0]);
        assert!(!idx.multisig_outputs[&1_000_000][0].is_used);

        let withdraw = Transaction {
            prefix: TransactionPrefix {
                version: 2,
                unlock_time: 0,
                inputs: vec![TransactionInput::Multisignature(MultisignatureInput {
                    amount: 1_000_000,
                    signature_count: 1,
                    output_index: 0,
                    term: 21_900,
                })],
                outputs: vec![],
                extra: vec![],
            },
            signatures: vec![vec![]],
        };
        let withdraw_hash = withdraw.hash();
        idx.push_transaction(&withdraw, withdraw_hash, at(5, 1), 5)
            .unwrap();
        assert!(idx.multisig_outputs[&1_000_000][0].is_used);

        idx.pop_transaction(&withdraw, &withdraw_hash);
        assert!(!idx.multisig_outputs[&1_000_000][0].is_used);
    }

    #[test]
    fn multisig_duplicate_input_rejected() {
        let mut idx = ChainIndexes::default();
        let deposit = deposit_tx(1_000_000, 21_900);
        idx.push_transaction(&deposit, deposit.hash(), at(0, 1), 0)
            .unwrap();
        let double = Transaction {
            prefix: TransactionPrefix {
                version: 2,
                unlock_time: 0,
                inputs: vec![
                    TransactionInput::Multisignature(MultisignatureInput {
                        amount: 1_000_000,
                        signature_count: 1,
                        output_index: 0,
                        term: 21_900,
                    }),
                    TransactionInput::Multisignature(MultisignatureInput {
                        amount: 1_000_000,
                        signature_count: 1,
                        output_index: 0,
                        term: 21_900,
                    }),
                ],
                outputs: vec![],
                extra: vec![],
            },
            signatures: vec![vec![], vec![]],
        };
        assert_eq!(
            idx.push_transaction(&double, double.hash(), at(1, 1), 1),
            Err(IndexError::MultisigDuplicate)
        );
    }

    #[test]
    fn multisig_out_of_range_rolls_back() {
        let mut idx = ChainIndexes::default();
        let withdraw = Transaction {
            prefix: TransactionPrefix {
                version: 2,
                unlock_time: 0,
                inputs: vec![
                    TransactionInput::Key(KeyInput {
                        amount: 10,
                        output_indexes: vec![0],
                        key_image: KeyImage([9u8; 32]),
                    }),
                    TransactionInput::Multisignature(MultisignatureInput {
                        amount: 1_000_000,
                        signature_count: 1,
                        output_index: 42,
                        term: 0,
                    }),
                ],
                outputs: vec![],
                extra: vec![],
            },
            signatures: vec![vec![], vec![]],
        };
        assert_eq!(
            idx.push_transaction(&withdraw, withdraw.hash(), at(0, 1), 0),
            Err(IndexError::MultisigOutOfRange)
        );
        assert!(!idx.is_key_image_spent(&KeyImage([9u8; 32])));
    }

    #[test]
    fn deposit_index_prefix_sums() {
        let mut index = DepositIndex::default();
        index.push_block(1_000, 0);
        index.push_block(500, 30);
        index.push_block(-700, 10);
        assert_eq!(index.full_deposit_amount(), 800);
        assert_eq!(index.deposit_amount_at_height(0), 1_000);
        assert_eq!(index.deposit_amount_at_height(1), 1_500);
        assert_eq!(index.deposit_interest_at_height(2), 40);
        index.pop_block();
        assert_eq!(index.full_deposit_amount(), 1_500);
    }

    #[test]
    fn timestamp_index_range_query() {
        let mut idx = ChainIndexes::default();
        let h1 = crate::cn_fast_hash(b"1");
        let h2 = crate::cn_fast_hash(b"2");
        idx.add_block_timestamp(100, h1);
        idx.add_block_timestamp(200, h2);
        assert_eq!(idx.blocks_by_timestamp(50, 150, 10), vec![h1]);
        assert_eq!(idx.blocks_by_timestamp(0, 500, 10).len(), 2);
        idx.remove_block_timestamp(100, &h1);
        assert!(idx.blocks_by_timestamp(50, 150, 10).is_empty());
    }

    #[test]
    fn payment_id_index_tracks_tx() {
        let mut idx = ChainIndexes::default();
        let payment_id = [0x11u8; 32];
        let mut tx = key_spend_tx(4, 10);
        crate::blockchain::block::add_payment_id_to_extra(&mut tx.prefix.extra, &payment_id);
        let hash = tx.hash();
        idx.push_transaction(&tx, hash, at(0, 1), 0).unwrap();
        assert_eq!(idx.transactions_by_payment_id(&payment_id), vec![hash]);
        idx.pop_transaction(&tx, &hash);
        assert!(idx.transactions_by_payment_id(&payment_id).is_empty());
    }

    #[test]
    fn generated_transactions_cumulative() {
        let mut idx = ChainIndexes::default();
        idx.push_generated_transactions(1);
        idx.push_generated_transactions(3);
        assert_eq!(idx.total_transactions(), 4);
        idx.pop_generated_transactions();
        assert_eq!(idx.total_transactions(), 1);
    }
}
