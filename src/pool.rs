//! Transaction memory pool.
//!
//! A content-addressed store of pending transactions with a fee-priority
//! ordering, key-image and multisignature double-spend guards, TTL expiry,
//! and block-template assembly. The priority index and the hash map are kept
//! consistent by mutating both under the pool lock.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::blockchain::block::{Transaction, TransactionInput};
use crate::codec;
use crate::currency::Currency;
use crate::crypto::KeyImage;
use crate::{Hash, NULL_HASH};

/// Clock abstraction so expiry logic is testable.
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall-clock seconds since the UNIX epoch.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A chain position a transaction was checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    pub id: Hash,
}

impl BlockInfo {
    pub fn empty() -> Self {
        BlockInfo {
            height: 0,
            id: NULL_HASH,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id == NULL_HASH
    }
}

/// Cached validation state of a pool transaction: the newest block its
/// inputs referenced, and the chain tip it last failed against.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TxCheckInfo {
    pub max_used: BlockInfo,
    pub last_failed: BlockInfo,
}

impl Default for TxCheckInfo {
    fn default() -> Self {
        TxCheckInfo {
            max_used: BlockInfo::empty(),
            last_failed: BlockInfo::empty(),
        }
    }
}

/// Chain-state queries the pool performs while validating. Implemented by
/// the blockchain engine.
pub trait TransactionValidator {
    /// Validate inputs against current chain state, consulting and updating
    /// the cached check info.
    fn check_transaction_inputs_cached(&self, tx: &Transaction, info: &mut TxCheckInfo) -> bool;
    /// Whether any key image of `tx` is already spent in the chain.
    fn have_spent_key_images(&self, tx: &Transaction) -> bool;
    /// Whether a transaction of this size is acceptable for relay.
    fn check_transaction_size(&self, blob_size: usize) -> bool;
    /// Current chain height.
    fn tip_height(&self) -> u64;
}

/// Why a transaction was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxRejectReason {
    InvalidInput,
    DoubleSpendInPool,
    FeeTooLow,
    TooLarge,
    Overflow,
    CoinbaseInPool,
    RecentlyDeleted,
    InvalidTtl,
}

/// Outcome of [`TransactionPool::add_tx`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddTxResult {
    Added,
    AlreadyPresent,
    Invalid(TxRejectReason),
}

/// Priority order: fee/size descending, then size ascending, then arrival.
/// The rate comparison cross-multiplies in 128 bits to avoid division.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PriorityKey {
    fee: u64,
    blob_size: u64,
    receive_time: u64,
    hash: Hash,
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = self.fee as u128 * other.blob_size as u128;
        let rhs = other.fee as u128 * self.blob_size as u128;
        rhs.cmp(&lhs)
            .then(self.blob_size.cmp(&other.blob_size))
            .then(self.receive_time.cmp(&other.receive_time))
            .then(self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A pooled transaction with its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub blob_size: usize,
    pub fee: u64,
    pub keep_by_block: bool,
    pub receive_time: u64,
    pub check_info: TxCheckInfo,
}

/// Versioned persistence record (`poolstate`).
#[derive(Serialize, Deserialize)]
struct PoolStateRecord {
    version: u32,
    entries: Vec<PoolEntry>,
    recently_deleted: Vec<(Hash, u64)>,
}

const POOL_STATE_VERSION: u32 = 1;

/// The memory pool.
pub struct TransactionPool {
    currency: Currency,
    time: std::sync::Arc<dyn TimeProvider>,
    transactions: HashMap<Hash, PoolEntry>,
    priority: BTreeSet<PriorityKey>,
    /// Key image → pool transactions claiming it.
    spent_key_images: HashMap<KeyImage, HashSet<Hash>>,
    /// `(amount, global index)` of multisignature outputs → claiming txs.
    spent_multisig_outputs: HashMap<(u64, u32), HashSet<Hash>>,
    /// Hash → deletion time; blocks immediate re-acceptance.
    recently_deleted: HashMap<Hash, u64>,
}

impl TransactionPool {
    pub fn new(currency: Currency, time: std::sync::Arc<dyn TimeProvider>) -> Self {
        TransactionPool {
            currency,
            time,
            transactions: HashMap::new(),
            priority: BTreeSet::new(),
            spent_key_images: HashMap::new(),
            spent_multisig_outputs: HashMap::new(),
            recently_deleted: HashMap::new(),
        }
    }

    /// Validate and admit a transaction.
    ///
    /// `keep_by_block` marks transactions arriving inside a block (or
    /// returned by a reorg); they bypass relay policy and stay pooled even
    /// when not currently spendable.
    pub fn add_tx<V: TransactionValidator + ?Sized>(
        &mut self,
        tx: Transaction,
        validator: &V,
        keep_by_block: bool,
        height: u64,
    ) -> AddTxResult {
        let hash = tx.hash();
        if self.transactions.contains_key(&hash) {
            return AddTxResult::AlreadyPresent;
        }
        if !keep_by_block && self.recently_deleted.contains_key(&hash) {
            return AddTxResult::Invalid(TxRejectReason::RecentlyDeleted);
        }
        if tx.is_coinbase() {
            return AddTxResult::Invalid(TxRejectReason::CoinbaseInPool);
        }
        if tx.output_amount().is_none() {
            return AddTxResult::Invalid(TxRejectReason::Overflow);
        }

        let fee = match self.currency.transaction_fee(&tx, height) {
            Some(fee) => fee,
            None => return AddTxResult::Invalid(TxRejectReason::Overflow),
        };

        // TTL transactions carry no fee; everything else meets the minimum
        // unless it is a fusion transaction.
        if let Some(ttl) = tx.ttl() {
            if fee != 0 || ttl <= self.time.now() {
                return AddTxResult::Invalid(TxRejectReason::InvalidTtl);
            }
        } else if !keep_by_block
            && fee < self.currency.minimum_fee_for_height(height)
            && !self.currency.is_fusion_transaction(&tx, height)
        {
            tracing::info!(
                tx = %hex::encode(&hash[..8]),
                fee,
                "transaction fee is below the minimum"
            );
            return AddTxResult::Invalid(TxRejectReason::FeeTooLow);
        }

        let blob_size = tx.binary_size();
        if !keep_by_block && !validator.check_transaction_size(blob_size) {
            return AddTxResult::Invalid(TxRejectReason::TooLarge);
        }

        // In-pool double-spend guard over both input kinds.
        if !keep_by_block && self.have_spent_inputs(&tx) {
            tracing::info!(tx = %hex::encode(&hash[..8]), "double spend within the pool");
            return AddTxResult::Invalid(TxRejectReason::DoubleSpendInPool);
        }

        let mut check_info = TxCheckInfo::default();
        let inputs_valid = validator.check_transaction_inputs_cached(&tx, &mut check_info);
        if !inputs_valid && !keep_by_block {
            tracing::info!(tx = %hex::encode(&hash[..8]), "transaction inputs are invalid");
            return AddTxResult::Invalid(TxRejectReason::InvalidInput);
        }

        self.insert_entry(PoolEntry {
            tx,
            blob_size,
            fee,
            keep_by_block,
            receive_time: self.time.now(),
            check_info,
        });
        AddTxResult::Added
    }

    fn insert_entry(&mut self, entry: PoolEntry) {
        let hash = entry.tx.hash();
        for input in &entry.tx.prefix.inputs {
            match input {
                TransactionInput::Key(k) => {
                    self.spent_key_images
                        .entry(k.key_image)
                        .or_default()
                        .insert(hash);
                }
                TransactionInput::Multisignature(m) => {
                    self.spent_multisig_outputs
                        .entry((m.amount, m.output_index))
                        .or_default()
                        .insert(hash);
                }
                TransactionInput::Base(_) => {}
            }
        }
        self.priority.insert(PriorityKey {
            fee: entry.fee,
            blob_size: entry.blob_size as u64,
            receive_time: entry.receive_time,
            hash,
        });
        self.transactions.insert(hash, entry);
    }

    /// Whether any input of `tx` is claimed by a different pool transaction.
    fn have_spent_inputs(&self, tx: &Transaction) -> bool {
        for input in &tx.prefix.inputs {
            match input {
                TransactionInput::Key(k) => {
                    if self
                        .spent_key_images
                        .get(&k.key_image)
                        .is_some_and(|set| !set.is_empty())
                    {
                        return true;
                    }
                }
                TransactionInput::Multisignature(m) => {
                    if self
                        .spent_multisig_outputs
                        .get(&(m.amount, m.output_index))
                        .is_some_and(|set| !set.is_empty())
                    {
                        return true;
                    }
                }
                TransactionInput::Base(_) => {}
            }
        }
        false
    }

    /// Remove and return a transaction, remembering its hash so it is not
    /// immediately re-accepted from relays.
    pub fn take_tx(&mut self, hash: &Hash) -> Option<Transaction> {
        let entry = self.remove_entry(hash)?;
        self.recently_deleted.insert(*hash, self.time.now());
        Some(entry.tx)
    }

    fn remove_entry(&mut self, hash: &Hash) -> Option<PoolEntry> {
        let entry = self.transactions.remove(hash)?;
        self.priority.remove(&PriorityKey {
            fee: entry.fee,
            blob_size: entry.blob_size as u64,
            receive_time: entry.receive_time,
            hash: *hash,
        });
        for input in &entry.tx.prefix.inputs {
            match input {
                TransactionInput::Key(k) => {
                    if let Some(set) = self.spent_key_images.get_mut(&k.key_image) {
                        set.remove(hash);
                        if set.is_empty() {
                            self.spent_key_images.remove(&k.key_image);
                        }
                    }
                }
                TransactionInput::Multisignature(m) => {
                    let key = (m.amount, m.output_index);
                    if let Some(set) = self.spent_multisig_outputs.get_mut(&key) {
                        set.remove(hash);
                        if set.is_empty() {
                            self.spent_multisig_outputs.remove(&key);
                        }
                    }
                }
                TransactionInput::Base(_) => {}
            }
        }
        Some(entry)
    }

    /// Select transactions for a block template.
    ///
    /// Walks the priority order, skipping transactions that do not fit the
    /// remaining size budget, are not currently spendable, or collide with
    /// an already selected key image or multisignature output.
    pub fn fill_block_template<V: TransactionValidator + ?Sized>(
        &mut self,
        median_size: usize,
        max_cumulative_size: usize,
        _height: u64,
        validator: &V,
    ) -> (Vec<Hash>, usize, u64) {
        let max_total_size = (125 * median_size / 100).min(max_cumulative_size);

        let mut selected = Vec::new();
        let mut total_size = 0usize;
        let mut total_fee = 0u64;
        let mut used_key_images: HashSet<KeyImage> = HashSet::new();
        let mut used_multisig: HashSet<(u64, u32)> = HashSet::new();
        let mut new_check_info: Vec<(Hash, TxCheckInfo)> = Vec::new();

        let keys: Vec<PriorityKey> = self.priority.iter().copied().collect();
        for key in keys {
            let entry = match self.transactions.get(&key.hash) {
                Some(e) => e,
                None => continue,
            };
            if total_size + entry.blob_size > max_total_size {
                continue;
            }
            // TTL transactions are never mined.
            if entry.tx.ttl().is_some() {
                continue;
            }
            let mut info = entry.check_info;
            if !validator.check_transaction_inputs_cached(&entry.tx, &mut info) {
                new_check_info.push((key.hash, info));
                continue;
            }
            new_check_info.push((key.hash, info));

            let collides = entry.tx.prefix.inputs.iter().any(|input| match input {
                TransactionInput::Key(k) => used_key_images.contains(&k.key_image),
                TransactionInput::Multisignature(m) => {
                    used_multisig.contains(&(m.amount, m.output_index))
                }
                TransactionInput::Base(_) => false,
            });
            if collides {
                continue;
            }
            for input in &entry.tx.prefix.inputs {
                match input {
                    TransactionInput::Key(k) => {
                        used_key_images.insert(k.key_image);
                    }
                    TransactionInput::Multisignature(m) => {
                        used_multisig.insert((m.amount, m.output_index));
                    }
                    TransactionInput::Base(_) => {}
                }
            }
            total_size += entry.blob_size;
            total_fee += entry.fee;
            selected.push(key.hash);
        }

        for (hash, info) in new_check_info {
            if let Some(entry) = self.transactions.get_mut(&hash) {
                entry.check_info = info;
            }
        }
        (selected, total_size, total_fee)
    }

    /// Re-check every pooled transaction after the tip advanced; drop those
    /// the new chain state rejects. Returns the dropped hashes.
    pub fn on_blockchain_inc<V: TransactionValidator + ?Sized>(
        &mut self,
        _new_height: u64,
        _top_id: Hash,
        validator: &V,
    ) -> Vec<Hash> {
        self.revalidate(validator)
    }

    /// Same as [`Self::on_blockchain_inc`], for tip rollbacks.
    pub fn on_blockchain_dec<V: TransactionValidator + ?Sized>(
        &mut self,
        _new_height: u64,
        _top_id: Hash,
        validator: &V,
    ) -> Vec<Hash> {
        self.revalidate(validator)
    }

    fn revalidate<V: TransactionValidator + ?Sized>(&mut self, validator: &V) -> Vec<Hash> {
        let hashes: Vec<Hash> = self.transactions.keys().copied().collect();
        let mut removed = Vec::new();
        for hash in hashes {
            let entry = match self.transactions.get_mut(&hash) {
                Some(e) => e,
                None => continue,
            };
            let mut info = entry.check_info;
            let ok = validator.check_transaction_inputs_cached(&entry.tx, &mut info);
            entry.check_info = info;
            let keep_by_block = entry.keep_by_block;
            // Block-borne transactions ride out transient invalidity; a
            // reorg may make them spendable again.
            if !ok && !keep_by_block {
                self.remove_entry(&hash);
                self.recently_deleted.insert(hash, self.time.now());
                removed.push(hash);
            }
        }
        removed
    }

    /// Periodic maintenance: expire old and TTL-bearing transactions, and
    /// forget sufficiently old deleted hashes. Returns expired tx hashes.
    pub fn on_idle(&mut self) -> Vec<Hash> {
        let now = self.time.now();
        let mut expired = Vec::new();
        let hashes: Vec<Hash> = self.transactions.keys().copied().collect();
        for hash in hashes {
            let entry = match self.transactions.get(&hash) {
                Some(e) => e,
                None => continue,
            };
            let livetime = if entry.keep_by_block {
                self.currency.mempool_tx_from_alt_block_livetime
            } else {
                self.currency.mempool_tx_livetime
            };
            let ttl_expired = entry.tx.ttl().is_some_and(|ttl| ttl <= now);
            let aged_out = now.saturating_sub(entry.receive_time) > livetime;
            if ttl_expired || aged_out {
                self.remove_entry(&hash);
                // TTL transactions vanish without a trace; aged-out ones are
                // remembered like any other deletion.
                if !ttl_expired {
                    self.recently_deleted.insert(hash, now);
                }
                expired.push(hash);
            }
        }

        let forget_after = self.currency.forget_tx_periods * self.currency.mempool_tx_livetime;
        self.recently_deleted
            .retain(|_, deleted_at| now.saturating_sub(*deleted_at) <= forget_after);
        expired
    }

    /// Pool difference against a wallet's known set: `(new, deleted)`.
    pub fn get_difference(&self, known: &[Hash]) -> (Vec<Hash>, Vec<Hash>) {
        let known_set: HashSet<&Hash> = known.iter().collect();
        let new: Vec<Hash> = self
            .transactions
            .keys()
            .filter(|h| !known_set.contains(h))
            .copied()
            .collect();
        let deleted: Vec<Hash> = known
            .iter()
            .filter(|h| !self.transactions.contains_key(*h))
            .copied()
            .collect();
        (new, deleted)
    }

    pub fn have_tx(&self, hash: &Hash) -> bool {
        self.transactions.contains_key(hash)
    }

    pub fn get_tx(&self, hash: &Hash) -> Option<&Transaction> {
        self.transactions.get(hash).map(|e| &e.tx)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.keys().copied().collect()
    }

    /// All pooled transactions, priority order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.priority
            .iter()
            .filter_map(|key| self.transactions.get(&key.hash))
            .map(|e| e.tx.clone())
            .collect()
    }

    /// Pool transactions carrying a payment id.
    pub fn transactions_by_payment_id(&self, payment_id: &Hash) -> Vec<Hash> {
        self.transactions
            .iter()
            .filter(|(_, e)| e.tx.payment_id().as_ref() == Some(payment_id))
            .map(|(h, _)| *h)
            .collect()
    }

    /// Pool transactions received within `[begin, end]`, up to `limit`.
    pub fn transactions_by_timestamp(&self, begin: u64, end: u64, limit: usize) -> Vec<Hash> {
        self.transactions
            .iter()
            .filter(|(_, e)| e.receive_time >= begin && e.receive_time <= end)
            .take(limit)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Serialize pool contents for the `poolstate` record.
    pub fn serialize_state(&self) -> Option<Vec<u8>> {
        let record = PoolStateRecord {
            version: POOL_STATE_VERSION,
            entries: self.transactions.values().cloned().collect(),
            recently_deleted: self
                .recently_deleted
                .iter()
                .map(|(h, t)| (*h, *t))
                .collect(),
        };
        codec::to_binary(&record).ok()
    }

    /// Restore pool contents, re-validating every entry against the chain.
    pub fn restore_state<V: TransactionValidator + ?Sized>(
        &mut self,
        bytes: &[u8],
        validator: &V,
    ) {
        let record: PoolStateRecord = match codec::from_binary(bytes) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "pool state unreadable, starting empty");
                return;
            }
        };
        if record.version != POOL_STATE_VERSION {
            tracing::warn!(
                found = record.version,
                expected = POOL_STATE_VERSION,
                "pool state version mismatch, starting empty"
            );
            return;
        }
        self.recently_deleted = record.recently_deleted.into_iter().collect();
        let mut restored = 0usize;
        for mut entry in record.entries {
            let mut info = TxCheckInfo::default();
            if !validator.check_transaction_inputs_cached(&entry.tx, &mut info)
                && !entry.keep_by_block
            {
                continue;
            }
            entry.check_info = info;
            if !self.have_spent_inputs(&entry.tx) {
                self.insert_entry(entry);
                restored += 1;
            }
        }
        tracing::info!(restored, "restored transaction pool state");
    }
}
