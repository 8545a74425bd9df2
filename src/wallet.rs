//! Wallet transaction cache records.
//!
//! The durable wallet store is an external collaborator; this module holds
//! the record types it exchanges with the node plus a small in-memory
//! reference cache used by tests and the RPC facade. The cache consumes
//! transfer events and produces balance-change summaries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyImage, SecretKey};
use crate::transfers::container::BalanceSummary;
use crate::Hash;

/// Height sentinel of a transaction not yet in a block.
pub const WALLET_UNCONFIRMED_HEIGHT: u64 = u64::MAX;

/// A wallet's view of one transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub hash: Hash,
    pub timestamp: u64,
    /// `WALLET_UNCONFIRMED_HEIGHT` while unconfirmed.
    pub block_height: u64,
    pub is_sent: bool,
    pub fee: u64,
    /// Net amount from this wallet's perspective; negative for spends.
    pub total_amount: i64,
    pub extra: Vec<u8>,
    pub messages: Vec<String>,
    /// Tx secret key when we created the transaction (or re-derived it).
    pub secret_key: Option<SecretKey>,
}

/// One destination of an outgoing transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletTransfer {
    pub address: String,
    pub amount: u64,
    pub message: String,
}

/// An outgoing transaction not yet confirmed.
#[derive(Clone, Debug)]
pub struct UnconfirmedTransaction {
    pub transaction_hash: Hash,
    pub used_key_images: Vec<KeyImage>,
    pub send_time: u64,
    pub amount: u64,
}

/// Balance-change event produced whenever the cache contents move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceChanged {
    pub balances: BalanceSummary,
}

/// In-memory reference wallet cache.
#[derive(Default)]
pub struct WalletCache {
    transactions: Vec<WalletTransaction>,
    transfers: Vec<WalletTransfer>,
    unconfirmed: HashMap<Hash, UnconfirmedTransaction>,
    /// Payment id → offsets into `transactions`.
    payment_id_index: HashMap<Hash, Vec<usize>>,
}

impl WalletCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> &[WalletTransaction] {
        &self.transactions
    }

    pub fn transfers(&self) -> &[WalletTransfer] {
        &self.transfers
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Option<&WalletTransaction> {
        self.transactions.iter().find(|t| t.hash == *hash)
    }

    pub fn transactions_by_payment_id(&self, payment_id: &Hash) -> Vec<&WalletTransaction> {
        self.payment_id_index
            .get(payment_id)
            .map(|offsets| {
                offsets
                    .iter()
                    .filter_map(|&i| self.transactions.get(i))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record or update a transaction (TransactionUpdated event path).
    pub fn upsert_transaction(
        &mut self,
        record: WalletTransaction,
        payment_id: Option<Hash>,
        transfers: Vec<WalletTransfer>,
    ) {
        if let Some(existing) = self
            .transactions
            .iter_mut()
            .find(|t| t.hash == record.hash)
        {
            *existing = record;
        } else {
            let offset = self.transactions.len();
            if record.block_height != WALLET_UNCONFIRMED_HEIGHT {
                self.unconfirmed.remove(&record.hash);
            }
            if let Some(payment_id) = payment_id {
                self.payment_id_index
                    .entry(payment_id)
                    .or_default()
                    .push(offset);
            }
            self.transactions.push(record);
            self.transfers.extend(transfers);
        }
    }

    /// Drop a transaction the chain abandoned (TransactionDeleted path).
    pub fn delete_transaction(&mut self, hash: &Hash) {
        if let Some(position) = self.transactions.iter().position(|t| t.hash == *hash) {
            self.transactions.remove(position);
            for offsets in self.payment_id_index.values_mut() {
                offsets.retain(|&i| i != position);
                for offset in offsets.iter_mut() {
                    if *offset > position {
                        *offset -= 1;
                    }
                }
            }
            self.payment_id_index.retain(|_, offsets| !offsets.is_empty());
        }
        self.unconfirmed.remove(hash);
    }

    /// Track an outgoing transaction awaiting confirmation.
    pub fn add_unconfirmed(&mut self, tx: UnconfirmedTransaction) {
        self.unconfirmed.insert(tx.transaction_hash, tx);
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Whether any pending outgoing transaction already uses a key image.
    pub fn is_key_image_in_use(&self, image: &KeyImage) -> bool {
        self.unconfirmed
            .values()
            .any(|u| u.used_key_images.contains(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: u8, height: u64, amount: i64) -> WalletTransaction {
        WalletTransaction {
            hash: [hash; 32],
            timestamp: 1_000,
            block_height: height,
            is_sent: amount < 0,
            fee: 10,
            total_amount: amount,
            extra: vec![],
            messages: vec![],
            secret_key: None,
        }
    }

    #[test]
    fn upsert_and_lookup() {
        let mut cache = WalletCache::new();
        cache.upsert_transaction(record(1, 100, 500), Some([7u8; 32]), vec![]);
        cache.upsert_transaction(record(2, 101, -300), None, vec![]);
        assert_eq!(cache.transactions().len(), 2);
        assert!(cache.transaction_by_hash(&[1u8; 32]).is_some());
        assert_eq!(cache.transactions_by_payment_id(&[7u8; 32]).len(), 1);

        // Updating in place does not duplicate.
        cache.upsert_transaction(record(1, 102, 500), None, vec![]);
        assert_eq!(cache.transactions().len(), 2);
        assert_eq!(
            cache.transaction_by_hash(&[1u8; 32]).unwrap().block_height,
            102
        );
    }

    #[test]
    fn delete_adjusts_payment_index() {
        let mut cache = WalletCache::new();
        cache.upsert_transaction(record(1, 100, 1), Some([7u8; 32]), vec![]);
        cache.upsert_transaction(record(2, 101, 2), Some([7u8; 32]), vec![]);
        cache.delete_transaction(&[1u8; 32]);
        let remaining = cache.transactions_by_payment_id(&[7u8; 32]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].hash, [2u8; 32]);
    }

    #[test]
    fn unconfirmed_tracking() {
        let mut cache = WalletCache::new();
        cache.add_unconfirmed(UnconfirmedTransaction {
            transaction_hash: [3u8; 32],
            used_key_images: vec![KeyImage([9u8; 32])],
            send_time: 1_000,
            amount: 77,
        });
        assert_eq!(cache.unconfirmed_count(), 1);
        assert!(cache.is_key_image_in_use(&KeyImage([9u8; 32])));
        assert!(!cache.is_key_image_in_use(&KeyImage([1u8; 32])));

        // Confirmation clears the pending entry.
        cache.upsert_transaction(record(3, 200, -77), None, vec![]);
        assert_eq!(cache.unconfirmed_count(), 0);
    }
}
