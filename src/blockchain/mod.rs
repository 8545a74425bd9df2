//! Blockchain engine: validation pipeline, push/pop state machine, reorg
//! handling and checkpoint enforcement.
//!
//! The engine owns the block log and every secondary index. All mutation
//! happens under the caller's blockchain lock; `Core` (below) enforces the
//! pool → blockchain lock order so a reorg can return transactions to the
//! pool without deadlocking.

pub mod block;
pub mod indexes;
pub mod storage;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::blockchain::block::{
    check_hash, relative_to_absolute_offsets, Block, BlockEntry, KeyInput, MultisignatureInput,
    Transaction, TransactionEntry, TransactionIndex, TransactionInput, TransactionOutputTarget,
    TRANSACTION_VERSION_1,
};
use crate::blockchain::indexes::ChainIndexes;
use crate::blockchain::storage::{
    ChainCachesRecord, ChainDb, ChainIndicesRecord, StorageError, CHAIN_CACHES_VERSION,
    CHAIN_INDICES_VERSION,
};
use crate::blockchain::store::BlockStore;
use crate::checkpoints::Checkpoints;
use crate::constants;
use crate::crypto::{check_ring_signature, check_signature, PublicKey, Signature};
use crate::currency::{median_value, AccountPublicAddress, Currency, BLOCK_MAJOR_VERSION_1};
use crate::observers::{BlockAdded, EventBus, PoolChanged};
use crate::pool::{
    AddTxResult, BlockInfo, SystemTimeProvider, TimeProvider, TransactionPool,
    TransactionValidator, TxCheckInfo,
};
use crate::Hash;

/// Outcome flags of handling one incoming block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockVerificationContext {
    pub added_to_main_chain: bool,
    pub verification_failed: bool,
    pub marked_as_orphaned: bool,
    pub already_exists: bool,
    pub switched_to_alt_chain: bool,
}

/// Engine errors that are not per-block verification verdicts.
#[derive(Debug, thiserror::Error)]
pub enum BlockchainError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("genesis block mismatch: stored chain starts at {0}")]
    GenesisMismatch(String),
    #[error("checkpoint rollback failed at height {0}")]
    RollbackFailed(u64),
}

/// An alternative-chain candidate block.
#[derive(Clone, Debug)]
struct AltBlockEntry {
    block: Block,
    height: u64,
    cumulative_difficulty: u64,
}

/// The chain state machine.
pub struct Blockchain {
    currency: Currency,
    checkpoints: Checkpoints,
    time: Arc<dyn TimeProvider>,
    bus: Arc<EventBus>,
    store: BlockStore,
    indexes: ChainIndexes,
    alternative_chains: HashMap<Hash, AltBlockEntry>,
    current_cumulative_size_limit: usize,
    db: Option<ChainDb>,
    /// Scratch space carrying popped transactions from `discard_tip_block`
    /// to `pop_block`.
    last_popped_transactions: Option<Vec<Transaction>>,
}

impl Blockchain {
    /// Initialize the chain: load from `db` when present, otherwise start
    /// from genesis. Rolls back to the last matching checkpoint.
    pub fn new(
        currency: Currency,
        mut checkpoints: Checkpoints,
        time: Arc<dyn TimeProvider>,
        bus: Arc<EventBus>,
        db: Option<ChainDb>,
    ) -> Result<Self, BlockchainError> {
        checkpoints
            .add_checkpoint_hash(0, currency.genesis_block_hash())
            .map_err(|e| BlockchainError::GenesisMismatch(e.to_string()))?;

        let mut chain = Blockchain {
            currency,
            checkpoints,
            time,
            bus,
            store: BlockStore::new(),
            indexes: ChainIndexes::default(),
            alternative_chains: HashMap::new(),
            current_cumulative_size_limit: 0,
            db: None,
            last_popped_transactions: None,
        };

        let stored = match &db {
            Some(db) => db.load_blocks()?,
            None => Vec::new(),
        };
        chain.db = db;

        if stored.is_empty() {
            let genesis = chain.currency.genesis_block().clone();
            let id = genesis.hash();
            let mut bvc = BlockVerificationContext::default();
            if !chain.push_block(genesis, Vec::new(), id, &mut bvc) {
                return Err(BlockchainError::GenesisMismatch(
                    "generated genesis block failed validation".into(),
                ));
            }
            chain.persist_tip();
        } else {
            let genesis_hash = stored[0].block.hash();
            if genesis_hash != chain.currency.genesis_block_hash() {
                return Err(BlockchainError::GenesisMismatch(hex::encode(genesis_hash)));
            }
            chain.rebuild_from_entries(stored)?;
            tracing::info!(height = chain.height(), "loaded blockchain from storage");
        }

        chain.rollback_to_last_checkpoint()?;
        chain.update_cumulative_size_limit();
        Ok(chain)
    }

    fn rebuild_from_entries(&mut self, entries: Vec<BlockEntry>) -> Result<(), BlockchainError> {
        let caches = match &self.db {
            Some(db) => db.get_caches()?,
            None => None,
        };
        let use_caches =
            caches.as_ref().map(|c| c.generated_transactions.len()) == Some(entries.len());

        for entry in &entries {
            let hash = entry.block.hash();
            self.indexes.add_block_timestamp(entry.block.timestamp, hash);
            if !use_caches {
                let mut tx_index = TransactionIndex {
                    block: entry.height as u32,
                    transaction: 0,
                };
                for tx_entry in &entry.transactions {
                    let tx_hash = tx_entry.tx.hash();
                    self.indexes
                        .push_transaction(&tx_entry.tx, tx_hash, tx_index, entry.height)
                        .map_err(|e| {
                            BlockchainError::GenesisMismatch(format!(
                                "stored chain is inconsistent: {e}"
                            ))
                        })?;
                    tx_index.transaction += 1;
                }
                let interest = entry
                    .transactions
                    .iter()
                    .map(|t| self.currency.transaction_interest(&t.tx, entry.height))
                    .sum();
                let deposit_delta = deposit_delta_of(&entry.transactions);
                self.indexes.deposit_index.push_block(deposit_delta, interest);
                self.indexes
                    .push_generated_transactions(entry.transactions.len() as u64);
            }
            self.store.push(entry.clone(), hash);
        }

        if use_caches {
            let caches = caches.expect("checked above");
            self.indexes.spent_key_images = caches.spent_key_images.into_iter().collect();
            self.indexes.transaction_map = caches.transaction_map.into_iter().collect();
            self.indexes.outputs_by_amount = caches.outputs_by_amount.into_iter().collect();
            self.indexes.multisig_outputs = caches.multisig_outputs.into_iter().collect();
            self.indexes.deposit_index = caches.deposit_index;
            self.indexes.generated_transactions = caches.generated_transactions;
        } else {
            tracing::info!("rebuilt chain caches from the block log");
        }

        if let Some(db) = &self.db {
            if let Some(indices) = db.get_indices()? {
                self.indexes.payment_id_index = indices.payment_id_index.into_iter().collect();
            }
        }
        Ok(())
    }

    /// Roll the chain back to the last height whose checkpoint still
    /// matches. Popped transactions are discarded; the node re-syncs them.
    fn rollback_to_last_checkpoint(&mut self) -> Result<(), BlockchainError> {
        let tip = self.height().saturating_sub(1);
        let last_valid = self
            .checkpoints
            .last_valid_height(tip, |h| self.store.hash_of(h));
        let failed_above = self
            .checkpoints
            .checkpoint_heights()
            .any(|h| h <= tip && h > last_valid);
        if !failed_above {
            return Ok(());
        }
        tracing::warn!(last_valid, tip, "checkpoint mismatch, rolling back");
        while self.height() > last_valid + 1 {
            if self.discard_tip_block().is_none() {
                return Err(BlockchainError::RollbackFailed(self.height()));
            }
        }
        Ok(())
    }

    // ── Queries ──

    /// Number of blocks in the main chain.
    pub fn height(&self) -> u64 {
        self.store.len()
    }

    pub fn tail_id(&self) -> Hash {
        self.store.tail_id().unwrap_or(crate::NULL_HASH)
    }

    /// `(tip hash, tip height index)`.
    pub fn top_info(&self) -> (Hash, u64) {
        (self.tail_id(), self.height().saturating_sub(1))
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn coins_in_circulation(&self) -> u64 {
        self.store
            .last()
            .map(|e| e.already_generated_coins)
            .unwrap_or(0)
    }

    pub fn have_block(&self, hash: &Hash) -> bool {
        self.store.contains(hash) || self.alternative_chains.contains_key(hash)
    }

    pub fn block_id_by_height(&self, height: u64) -> Option<Hash> {
        self.store.hash_of(height)
    }

    pub fn block_height(&self, hash: &Hash) -> Option<u64> {
        self.store.height_of(hash)
    }

    pub fn block_by_height(&self, height: u64) -> Option<&BlockEntry> {
        self.store.get(height)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<&BlockEntry> {
        self.store.height_of(hash).and_then(|h| self.store.get(h))
    }

    pub fn block_difficulty(&self, height: u64) -> u64 {
        let cd = |h: u64| {
            self.store
                .get(h)
                .map(|e| e.cumulative_difficulty)
                .unwrap_or(0)
        };
        if height == 0 {
            cd(0)
        } else {
            cd(height) - cd(height - 1)
        }
    }

    pub fn alternative_block_count(&self) -> usize {
        self.alternative_chains.len()
    }

    pub fn build_sparse_chain(&self) -> Vec<Hash> {
        self.store.build_sparse_chain()
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Option<&TransactionEntry> {
        let index = self.indexes.transaction_map.get(hash)?;
        self.store
            .get(index.block as u64)
            .and_then(|e| e.transactions.get(index.transaction as usize))
    }

    pub fn have_transaction(&self, hash: &Hash) -> bool {
        self.indexes.transaction_map.contains_key(hash)
    }

    /// Height of the block containing a transaction.
    pub fn transaction_block_height(&self, hash: &Hash) -> Option<u64> {
        self.indexes
            .transaction_map
            .get(hash)
            .map(|index| index.block as u64)
    }

    pub fn is_key_image_spent(&self, image: &crate::crypto::KeyImage) -> bool {
        self.indexes.is_key_image_spent(image)
    }

    pub fn full_deposit_amount(&self) -> u64 {
        self.indexes.deposit_index.full_deposit_amount()
    }

    pub fn deposit_totals_at(&self, height: u64) -> (u64, u64) {
        (
            self.indexes.deposit_index.deposit_amount_at_height(height),
            self.indexes.deposit_index.deposit_interest_at_height(height),
        )
    }

    pub fn transactions_by_payment_id(&self, payment_id: &Hash) -> Vec<Hash> {
        self.indexes.transactions_by_payment_id(payment_id)
    }

    /// Resolve a multisignature output reference `(amount, global index)` to
    /// the hash of its creating transaction and the output position in it.
    pub fn multisig_output_reference(&self, amount: u64, output_index: u32) -> Option<(Hash, u32)> {
        let usage = *self
            .indexes
            .multisig_outputs
            .get(&amount)?
            .get(output_index as usize)?;
        let entry = self
            .store
            .get(usage.transaction_index.block as u64)?
            .transactions
            .get(usage.transaction_index.transaction as usize)?;
        Some((entry.tx.hash(), usage.output_index as u32))
    }

    pub fn blocks_by_timestamp(&self, begin: u64, end: u64, limit: usize) -> Vec<Hash> {
        self.indexes.blocks_by_timestamp(begin, end, limit)
    }

    pub fn current_cumulative_size_limit(&self) -> usize {
        self.current_cumulative_size_limit
    }

    fn adjusted_time(&self) -> u64 {
        self.time.now()
    }

    /// Difficulty required of the next main-chain block.
    pub fn difficulty_for_next_block(&self) -> u64 {
        let version = self.currency.block_version_for_height(self.height());
        let count = self.currency.difficulty_blocks_count_by_version(version);
        let (timestamps, cumulative) = self.store.difficulty_samples(count);
        self.currency
            .next_difficulty(version, self.height(), &timestamps, &cumulative)
    }

    /// Median block size over the reward window.
    pub fn median_block_size(&self) -> usize {
        let sizes = self.store.last_block_sizes(self.currency.reward_blocks_window);
        median_value(&sizes)
    }

    fn update_cumulative_size_limit(&mut self) {
        let median = self
            .median_block_size()
            .max(self.currency.block_granted_full_reward_zone);
        self.current_cumulative_size_limit = median * 2;
    }

    // ── Incoming blocks ──

    /// Handle a candidate block: extend the main chain, store it as an
    /// alternative, or reject it. The pool is already locked by the caller.
    pub fn add_new_block(
        &mut self,
        block: Block,
        pool: &mut TransactionPool,
    ) -> BlockVerificationContext {
        let mut bvc = BlockVerificationContext::default();
        let id = block.hash();

        if self.have_block(&id) {
            tracing::trace!(block = %hex::encode(&id[..8]), "block already exists");
            bvc.already_exists = true;
            return bvc;
        }

        if block.prev_block_hash != self.tail_id() {
            self.handle_alternative_block(block, id, &mut bvc, pool);
            return bvc;
        }

        let (transactions, missing) = self.take_block_transactions(&block, pool);
        if missing {
            for tx in transactions {
                let _ = pool.add_tx(tx, self, true, self.height());
            }
            bvc.verification_failed = true;
            return bvc;
        }

        if self.push_block(block, transactions.clone(), id, &mut bvc) {
            let height = self.height() - 1;
            self.persist_tip();
            if height % constants::AUTOSAVE_INTERVAL_BLOCKS == 0 {
                self.store_caches();
            }
            self.bus
                .block_added
                .publish(BlockAdded::MainChain { hash: id, height });
        } else {
            for tx in transactions {
                let _ = pool.add_tx(tx, self, true, self.height());
            }
        }
        bvc
    }

    /// Pull the block's transactions out of the pool in listed order.
    /// Returns the bodies taken so far and whether any hash was missing.
    fn take_block_transactions(
        &self,
        block: &Block,
        pool: &mut TransactionPool,
    ) -> (Vec<Transaction>, bool) {
        let mut transactions = Vec::with_capacity(block.transaction_hashes.len());
        for hash in &block.transaction_hashes {
            match pool.take_tx(hash) {
                Some(tx) => transactions.push(tx),
                None => {
                    tracing::info!(
                        tx = %hex::encode(&hash[..8]),
                        "block references a transaction missing from the pool"
                    );
                    return (transactions, true);
                }
            }
        }
        (transactions, false)
    }

    /// Validate and append a block whose transactions are materialized.
    /// On failure nothing is left in the chain state.
    pub fn push_block(
        &mut self,
        block: Block,
        transactions: Vec<Transaction>,
        id: Hash,
        bvc: &mut BlockVerificationContext,
    ) -> bool {
        if self.store.contains(&id) {
            tracing::error!(block = %hex::encode(&id[..8]), "block already in chain");
            bvc.verification_failed = true;
            return false;
        }

        let height = self.height();

        if !self.check_block_version(&block, height) {
            bvc.verification_failed = true;
            return false;
        }

        // Merged mining was retired at the LWMA3 fork.
        if block.base_transaction.has_merge_mining_tag()
            && height >= self.currency.upgrade_height_v6
        {
            tracing::error!("merge mining tag found in coinbase extra");
            bvc.verification_failed = true;
            return false;
        }

        if block.prev_block_hash != self.tail_id() {
            tracing::info!(
                block = %hex::encode(&id[..8]),
                "block has wrong previous hash"
            );
            bvc.verification_failed = true;
            return false;
        }

        if !self.check_block_timestamp_main(&block) {
            tracing::info!(block = %hex::encode(&id[..8]), "block has invalid timestamp");
            bvc.verification_failed = true;
            return false;
        }

        let difficulty = self.difficulty_for_next_block();
        if difficulty == 0 {
            tracing::error!("difficulty overhead");
            bvc.verification_failed = true;
            return false;
        }

        if self.checkpoints.is_in_checkpoint_zone(height) {
            let (valid, _) = self.checkpoints.check_block(height, &id);
            if !valid {
                bvc.verification_failed = true;
                return false;
            }
        } else if !self.currency.check_proof_of_work(&block, difficulty) {
            tracing::info!(
                block = %hex::encode(&id[..8]),
                difficulty,
                "block has too weak proof of work"
            );
            bvc.verification_failed = true;
            return false;
        }

        if !self.prevalidate_miner_transaction(&block, height) {
            tracing::info!(block = %hex::encode(&id[..8]), "coinbase prevalidation failed");
            bvc.verification_failed = true;
            return false;
        }

        let coinbase_hash = block.base_transaction.hash();
        let mut entry = BlockEntry {
            block: block.clone(),
            height,
            block_cumulative_size: 0,
            cumulative_difficulty: 0,
            already_generated_coins: 0,
            transactions: Vec::with_capacity(1 + transactions.len()),
        };

        let mut tx_index = TransactionIndex {
            block: height as u32,
            transaction: 0,
        };
        let coinbase_globals = match self.indexes.push_transaction(
            &block.base_transaction,
            coinbase_hash,
            tx_index,
            height,
        ) {
            Ok(globals) => globals,
            Err(e) => {
                tracing::error!(error = %e, "failed to index coinbase");
                bvc.verification_failed = true;
                return false;
            }
        };
        entry.transactions.push(TransactionEntry {
            tx: block.base_transaction.clone(),
            global_output_indexes: coinbase_globals,
        });

        let coinbase_size = block.base_transaction.binary_size();
        let mut cumulative_size = coinbase_size;
        let mut fee_summary = 0u64;
        let mut interest_summary = 0u64;

        for (i, tx) in transactions.iter().enumerate() {
            let tx_hash = block.transaction_hashes[i];
            let blob_size = tx.binary_size();
            let fee = self.currency.transaction_fee(tx, height).unwrap_or(0);

            let mut tx_valid = true;
            if block.major_version == BLOCK_MAJOR_VERSION_1
                && tx.prefix.version > TRANSACTION_VERSION_1
            {
                tracing::info!(tx = %hex::encode(&tx_hash[..8]), "transaction version not allowed yet");
                tx_valid = false;
            }
            if tx_valid && !self.check_transaction_inputs(tx, &mut 0) {
                tracing::info!(tx = %hex::encode(&tx_hash[..8]), "transaction has wrong inputs");
                tx_valid = false;
            }
            if tx_valid && !self.check_tx_outputs(tx, height) {
                tracing::info!(tx = %hex::encode(&tx_hash[..8]), "transaction has invalid outputs");
                tx_valid = false;
            }
            let globals = if tx_valid {
                match self.indexes.push_transaction(tx, tx_hash, {
                    tx_index.transaction += 1;
                    tx_index
                }, height)
                {
                    Ok(globals) => Some(globals),
                    Err(e) => {
                        tracing::info!(tx = %hex::encode(&tx_hash[..8]), error = %e, "indexing rejected transaction");
                        tx_index.transaction -= 1;
                        None
                    }
                }
            } else {
                None
            };

            match globals {
                Some(globals) => {
                    entry.transactions.push(TransactionEntry {
                        tx: tx.clone(),
                        global_output_indexes: globals,
                    });
                    cumulative_size += blob_size;
                    fee_summary += fee;
                    interest_summary += self.currency.transaction_interest(tx, height);
                }
                None => {
                    self.unwind_block_transactions(&entry);
                    bvc.verification_failed = true;
                    return false;
                }
            }
        }

        if cumulative_size > self.currency.max_block_cumulative_size(height) {
            tracing::info!(cumulative_size, "block is too big");
            self.unwind_block_transactions(&entry);
            bvc.verification_failed = true;
            return false;
        }

        let already_generated_coins = self
            .store
            .last()
            .map(|e| e.already_generated_coins)
            .unwrap_or(0);
        let (reward, emission_change) = match self.validate_miner_transaction(
            &block,
            height,
            cumulative_size,
            already_generated_coins,
            fee_summary,
        ) {
            Some(v) => v,
            None => {
                tracing::info!(block = %hex::encode(&id[..8]), "invalid miner transaction");
                self.unwind_block_transactions(&entry);
                bvc.verification_failed = true;
                return false;
            }
        };

        entry.block_cumulative_size = cumulative_size;
        entry.cumulative_difficulty = difficulty
            + self
                .store
                .last()
                .map(|e| e.cumulative_difficulty)
                .unwrap_or(0);
        entry.already_generated_coins = (already_generated_coins as i128
            + emission_change as i128
            + interest_summary as i128) as u64;

        let deposit_delta = deposit_delta_of(&entry.transactions);
        self.indexes.deposit_index.push_block(deposit_delta, interest_summary);
        self.indexes
            .push_generated_transactions(entry.transactions.len() as u64);
        self.indexes.add_block_timestamp(block.timestamp, id);
        self.store.push(entry, id);
        self.update_cumulative_size_limit();

        tracing::debug!(
            block = %hex::encode(&id[..8]),
            height,
            difficulty,
            reward = %self.currency.format_amount(reward),
            fees = %self.currency.format_amount(fee_summary),
            size = cumulative_size,
            "block added"
        );
        bvc.added_to_main_chain = true;
        true
    }

    /// Undo index entries of a partially validated block (reverse order).
    fn unwind_block_transactions(&mut self, entry: &BlockEntry) {
        for tx_entry in entry.transactions.iter().rev() {
            let hash = tx_entry.tx.hash();
            self.indexes.pop_transaction(&tx_entry.tx, &hash);
        }
    }

    /// Pop the tip block, returning its non-coinbase transactions to the
    /// pool.
    pub fn pop_block(&mut self, pool: &mut TransactionPool) -> Option<Block> {
        let block = self.discard_tip_block()?;
        let height = self.height();
        if let Some(db) = &self.db {
            let _ = db.remove_block(height);
        }
        // Re-admit the popped transactions.
        let entry_txs = self.last_popped_transactions.take().unwrap_or_default();
        for tx in entry_txs {
            let _ = pool.add_tx(tx, &*self, true, height);
        }
        Some(block)
    }

    /// Pop the tip without returning transactions anywhere (startup
    /// rollback path).
    fn discard_tip_block(&mut self) -> Option<Block> {
        let (entry, hash) = self.store.pop_last()?;
        for tx_entry in entry.transactions.iter().rev() {
            let tx_hash = tx_entry.tx.hash();
            self.indexes.pop_transaction(&tx_entry.tx, &tx_hash);
        }
        self.indexes
            .remove_block_timestamp(entry.block.timestamp, &hash);
        self.indexes.deposit_index.pop_block();
        self.indexes.pop_generated_transactions();
        self.update_cumulative_size_limit();
        self.last_popped_transactions = Some(
            entry
                .transactions
                .iter()
                .skip(1)
                .map(|t| t.tx.clone())
                .collect(),
        );
        Some(entry.block)
    }

    // ── Alternative chains and reorg ──

    fn handle_alternative_block(
        &mut self,
        block: Block,
        id: Hash,
        bvc: &mut BlockVerificationContext,
        pool: &mut TransactionPool,
    ) {
        let block_height = match block.height() {
            Some(h) if h != 0 => h,
            _ => {
                tracing::error!(block = %hex::encode(&id[..8]), "alternative block has wrong coinbase height");
                bvc.verification_failed = true;
                return;
            }
        };

        if !self
            .checkpoints
            .is_alternative_block_allowed(self.height().saturating_sub(1), block_height)
        {
            tracing::debug!(
                block_height,
                chain_height = self.height(),
                "alternative block below checkpoint zone"
            );
            bvc.verification_failed = true;
            return;
        }

        let expected_version = self.currency.block_version_for_height(block_height);
        if block.major_version != expected_version {
            tracing::info!(
                got = block.major_version,
                expected = expected_version,
                "alternative block has wrong major version"
            );
            bvc.verification_failed = true;
            return;
        }

        let main_prev_height = self.store.height_of(&block.prev_block_hash);
        let alt_prev = self.alternative_chains.get(&block.prev_block_hash);

        if main_prev_height.is_none() && alt_prev.is_none() {
            bvc.marked_as_orphaned = true;
            tracing::info!(block = %hex::encode(&id[..8]), "block recognized as orphaned");
            return;
        }

        // Build the alt subchain back to the main-chain connection.
        let mut alt_chain: Vec<Hash> = Vec::new();
        let mut cursor = block.prev_block_hash;
        while let Some(entry) = self.alternative_chains.get(&cursor) {
            alt_chain.push(cursor);
            cursor = entry.block.prev_block_hash;
        }
        alt_chain.reverse();

        let (connect_height, prev_cumulative_difficulty) = match alt_chain.first() {
            Some(root) => {
                let root_entry = &self.alternative_chains[root];
                let connect = root_entry.height;
                if self.height() <= connect {
                    tracing::error!("main blockchain has wrong height for alt connection");
                    bvc.verification_failed = true;
                    return;
                }
                let connected = self.store.hash_of(connect - 1);
                if connected != Some(root_entry.block.prev_block_hash) {
                    tracing::error!("alternative chain has wrong connection to main chain");
                    bvc.verification_failed = true;
                    return;
                }
                let last = &self.alternative_chains[alt_chain.last().expect("non-empty")];
                (connect, last.cumulative_difficulty)
            }
            None => {
                let prev_height = main_prev_height.expect("checked above");
                let prev_cd = self
                    .store
                    .get(prev_height)
                    .map(|e| e.cumulative_difficulty)
                    .unwrap_or(0);
                (prev_height + 1, prev_cd)
            }
        };

        let height = match alt_chain.last() {
            Some(last) => self.alternative_chains[last].height + 1,
            None => connect_height,
        };
        if height != block_height {
            tracing::info!(height, block_height, "alternative block height mismatch");
            bvc.verification_failed = true;
            return;
        }

        // Timestamp check against the chain the block extends.
        let mut timestamps: Vec<u64> = alt_chain
            .iter()
            .map(|h| self.alternative_chains[h].block.timestamp)
            .collect();
        self.complete_timestamps(connect_height.saturating_sub(1), &mut timestamps);
        if !self.check_block_timestamp(timestamps, &block) {
            tracing::info!(
                block = %hex::encode(&id[..8]),
                timestamp = block.timestamp,
                "alternative block has invalid timestamp"
            );
            bvc.verification_failed = true;
            return;
        }

        let (checkpoint_valid, is_a_checkpoint) = self.checkpoints.check_block(height, &id);
        if !checkpoint_valid {
            tracing::error!("checkpoint validation failure on alternative block");
            bvc.verification_failed = true;
            return;
        }

        if block.base_transaction.has_merge_mining_tag()
            && height >= self.currency.upgrade_height_v6
        {
            tracing::error!("merge mining tag found in alternative coinbase");
            bvc.verification_failed = true;
            return;
        }

        // Proof of work is always verified for alternative blocks.
        let difficulty = self.difficulty_for_alternative_chain(&alt_chain, height);
        if difficulty == 0 {
            tracing::error!("difficulty overhead on alternative chain");
            bvc.verification_failed = true;
            return;
        }
        if !check_hash(&block.proof_of_work_hash(), difficulty) {
            tracing::info!(
                block = %hex::encode(&id[..8]),
                difficulty,
                "alternative block has not enough proof of work"
            );
            bvc.verification_failed = true;
            return;
        }

        if !self.prevalidate_miner_transaction(&block, height) {
            tracing::info!(block = %hex::encode(&id[..8]), "alternative coinbase prevalidation failed");
            bvc.verification_failed = true;
            return;
        }

        let entry = AltBlockEntry {
            block: block.clone(),
            height,
            cumulative_difficulty: prev_cumulative_difficulty + difficulty,
        };
        let cumulative_difficulty = entry.cumulative_difficulty;
        self.alternative_chains.insert(id, entry);
        self.indexes.orphan_index.entry(height).or_default().push(id);
        alt_chain.push(id);

        let main_cumulative = self
            .store
            .last()
            .map(|e| e.cumulative_difficulty)
            .unwrap_or(0);

        if is_a_checkpoint {
            tracing::info!(
                fork_height = connect_height,
                "reorganize forced by checkpoint in alternative chain"
            );
            let switched = self.switch_to_alternative(alt_chain, true, pool);
            bvc.added_to_main_chain = switched;
            bvc.switched_to_alt_chain = switched;
            bvc.verification_failed = !switched;
        } else if main_cumulative < cumulative_difficulty {
            tracing::info!(
                fork_height = connect_height,
                main_cumulative,
                alt_cumulative = cumulative_difficulty,
                "reorganize to heavier alternative chain"
            );
            let switched = self.switch_to_alternative(alt_chain, false, pool);
            bvc.added_to_main_chain = switched;
            bvc.switched_to_alt_chain = switched;
            bvc.verification_failed = !switched;
        } else {
            tracing::info!(
                block = %hex::encode(&id[..8]),
                height,
                difficulty,
                "block added as alternative"
            );
            self.bus
                .block_added
                .publish(BlockAdded::Alternative { hash: id, height });
        }
    }

    /// Switch the main chain to `alt_chain` (ordered root → tip). On a push
    /// failure the original chain is restored from the disconnect list.
    fn switch_to_alternative(
        &mut self,
        alt_chain: Vec<Hash>,
        discard_disconnected: bool,
        pool: &mut TransactionPool,
    ) -> bool {
        let split_height = match alt_chain.first() {
            Some(root) => self.alternative_chains[root].height,
            None => {
                tracing::error!("empty chain passed to switch");
                return false;
            }
        };
        if self.height() <= split_height {
            tracing::error!("blockchain size is lower than split height");
            return false;
        }

        // Anti-censorship: every main-chain transaction above the split must
        // also appear in the proposed alternative chain.
        let mut alt_tx_hashes: Vec<Hash> = Vec::new();
        for hash in &alt_chain {
            alt_tx_hashes.extend_from_slice(&self.alternative_chains[hash].block.transaction_hashes);
        }
        for height in split_height..self.height() {
            let entry = self.store.get(height).expect("height below tip");
            for tx_hash in &entry.block.transaction_hashes {
                if !alt_tx_hashes.contains(tx_hash) {
                    tracing::error!(
                        tx = %hex::encode(&tx_hash[..8]),
                        "alternative chain lacks a main-chain transaction, rejected"
                    );
                    return false;
                }
            }
        }

        // Disconnect the old chain tip-down, remembering it for rollback.
        let mut disconnected: Vec<Block> = Vec::new();
        while self.height() > split_height {
            let block = self
                .pop_block(pool)
                .expect("height above split implies a tip");
            disconnected.insert(0, block);
        }

        // Connect the alternative blocks in order.
        for (i, alt_id) in alt_chain.iter().enumerate() {
            let block = self.alternative_chains[alt_id].block.clone();
            let (transactions, missing) = self.take_block_transactions(&block, pool);
            let mut bvc = BlockVerificationContext::default();
            let pushed = !missing
                && self.push_block(block, transactions.clone(), *alt_id, &mut bvc)
                && bvc.added_to_main_chain;
            if !pushed {
                for tx in transactions {
                    let _ = pool.add_tx(tx, &*self, true, self.height());
                }
                tracing::info!("failed to switch to alternative blockchain");
                self.rollback_switching(disconnected, split_height, pool);
                // Drop the failed block and its descendants from the
                // alternative map.
                for dead in &alt_chain[i..] {
                    if let Some(entry) = self.alternative_chains.remove(dead) {
                        if let Some(list) = self.indexes.orphan_index.get_mut(&entry.height) {
                            list.retain(|h| h != dead);
                        }
                    }
                }
                return false;
            }
            self.persist_tip();
        }

        // Keep the abandoned blocks around as alternatives unless told not to.
        if !discard_disconnected {
            for block in disconnected {
                let id = block.hash();
                let mut bvc = BlockVerificationContext::default();
                self.handle_alternative_block(block, id, &mut bvc, pool);
            }
        }

        let mut new_chain = Vec::with_capacity(alt_chain.len());
        for alt_id in &alt_chain {
            if let Some(entry) = self.alternative_chains.remove(alt_id) {
                if let Some(list) = self.indexes.orphan_index.get_mut(&entry.height) {
                    list.retain(|h| h != alt_id);
                }
            }
            new_chain.push(*alt_id);
        }

        self.store_caches();
        self.bus.block_added.publish(BlockAdded::ChainSwitch {
            from_height: split_height,
            new_chain,
        });
        tracing::info!(
            split_height,
            new_height = self.height(),
            "successfully reorganized"
        );
        true
    }

    /// Restore the original chain after a failed switch. A failure here is
    /// fatal for the node's chain state and only logged.
    fn rollback_switching(
        &mut self,
        original_chain: Vec<Block>,
        rollback_height: u64,
        pool: &mut TransactionPool,
    ) {
        while self.height() > rollback_height {
            self.pop_block(pool);
        }
        for block in original_chain {
            let id = block.hash();
            let (transactions, missing) = self.take_block_transactions(&block, pool);
            let mut bvc = BlockVerificationContext::default();
            let pushed = !missing
                && self.push_block(block, transactions.clone(), id, &mut bvc)
                && bvc.added_to_main_chain;
            if !pushed {
                for tx in transactions {
                    let _ = pool.add_tx(tx, &*self, true, self.height());
                }
                tracing::error!(
                    "PANIC: failed to re-add block while rolling back a chain switch"
                );
                return;
            }
            self.persist_tip();
        }
        tracing::info!("rollback success");
    }

    /// Difficulty for the next block of an alternative chain, mixing main
    /// chain samples below the fork with the alt chain's own.
    fn difficulty_for_alternative_chain(&self, alt_chain: &[Hash], height: u64) -> u64 {
        let version = self.currency.block_version_for_height(height);
        let count = self.currency.difficulty_blocks_count_by_version(version);

        let mut timestamps: Vec<u64> = Vec::with_capacity(count);
        let mut cumulative: Vec<u64> = Vec::with_capacity(count);

        if alt_chain.len() < count {
            let stop = match alt_chain.first() {
                Some(root) => self.alternative_chains[root].height,
                None => height,
            };
            let main_count = (count - alt_chain.len()).min(stop as usize);
            let start = stop - main_count as u64;
            for h in start..stop {
                let entry = self.store.get(h).expect("below stop height");
                timestamps.push(entry.block.timestamp);
                cumulative.push(entry.cumulative_difficulty);
            }
            for hash in alt_chain {
                let entry = &self.alternative_chains[hash];
                timestamps.push(entry.block.timestamp);
                cumulative.push(entry.cumulative_difficulty);
            }
        } else {
            for hash in &alt_chain[alt_chain.len() - count..] {
                let entry = &self.alternative_chains[hash];
                timestamps.push(entry.block.timestamp);
                cumulative.push(entry.cumulative_difficulty);
            }
        }

        self.currency
            .next_difficulty(version, height, &timestamps, &cumulative)
    }

    /// Prepend main-chain timestamps so the vector reaches the check window.
    fn complete_timestamps(&self, start_top_height: u64, timestamps: &mut Vec<u64>) {
        let version = self
            .currency
            .block_version_for_height(start_top_height + 1);
        let window = self.currency.timestamp_check_window_by_version(version);
        if timestamps.len() >= window {
            return;
        }
        let need = window - timestamps.len();
        let stop = start_top_height + 1;
        let start = stop.saturating_sub(need as u64);
        let mut main: Vec<u64> = (start..stop)
            .filter_map(|h| self.store.get(h).map(|e| e.block.timestamp))
            .collect();
        main.extend_from_slice(timestamps);
        *timestamps = main;
    }

    // ── Validation helpers ──

    fn check_block_version(&self, block: &Block, height: u64) -> bool {
        let expected = self.currency.block_version_for_height(height);
        if block.major_version != expected {
            tracing::info!(
                got = block.major_version,
                expected,
                height,
                "block has wrong major version"
            );
            return false;
        }
        true
    }

    fn check_block_timestamp_main(&self, block: &Block) -> bool {
        let version = self.currency.block_version_for_height(self.height());
        let limit = self.currency.block_future_time_limit_by_version(version);
        if block.timestamp > self.adjusted_time() + limit {
            tracing::info!(timestamp = block.timestamp, "block timestamp is in the future");
            return false;
        }
        let window = self.currency.timestamp_check_window_by_version(version);
        let timestamps = self.store.last_timestamps(window);
        self.check_block_timestamp(timestamps, block)
    }

    fn check_block_timestamp(&self, timestamps: Vec<u64>, block: &Block) -> bool {
        let version = self.currency.block_version_for_height(self.height());
        let window = self.currency.timestamp_check_window_by_version(version);
        if timestamps.len() < window {
            return true;
        }
        let mut sorted = timestamps;
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        if block.timestamp < median {
            tracing::info!(
                timestamp = block.timestamp,
                median,
                "block timestamp is less than the median"
            );
            return false;
        }
        true
    }

    fn prevalidate_miner_transaction(&self, block: &Block, height: u64) -> bool {
        let coinbase = &block.base_transaction;
        if coinbase.prefix.inputs.len() != 1 {
            tracing::error!("coinbase has wrong input count");
            return false;
        }
        // Deposits allow a single signature group on the coinbase.
        if coinbase.signatures.len() > 1 {
            tracing::error!("coinbase has too many signatures");
            return false;
        }
        match &coinbase.prefix.inputs[0] {
            TransactionInput::Base(base) if base.block_index == height => {}
            TransactionInput::Base(base) => {
                tracing::info!(
                    got = base.block_index,
                    expected = height,
                    "coinbase has invalid height"
                );
                return false;
            }
            _ => {
                tracing::error!("coinbase input has the wrong type");
                return false;
            }
        }
        if coinbase.prefix.unlock_time != height + self.currency.mined_money_unlock_window {
            tracing::error!(
                unlock_time = coinbase.prefix.unlock_time,
                expected = height + self.currency.mined_money_unlock_window,
                "coinbase has wrong unlock time"
            );
            return false;
        }
        if !self.check_tx_outputs(coinbase, height) {
            tracing::info!("coinbase has invalid outputs");
            return false;
        }
        if coinbase.output_amount().is_none() {
            tracing::info!("coinbase outputs overflow");
            return false;
        }
        true
    }

    /// Reward validation with the historical 10-unit overpayment tolerance.
    fn validate_miner_transaction(
        &self,
        block: &Block,
        height: u64,
        cumulative_size: usize,
        already_generated_coins: u64,
        fees: u64,
    ) -> Option<(u64, i64)> {
        let miner_reward = block.base_transaction.output_amount()?;
        let median = self.median_block_size();
        let (reward, emission_change) = self.currency.block_reward(
            median,
            cumulative_size,
            already_generated_coins,
            fees,
            height,
        )?;

        // Overpayment tolerance of 10 atomic units.
        if miner_reward > reward && miner_reward - reward > 10 {
            tracing::error!(
                spent = %self.currency.format_amount(miner_reward),
                reward = %self.currency.format_amount(reward),
                "coinbase spends too much"
            );
            return None;
        }
        if miner_reward < reward {
            tracing::error!(
                spent = %self.currency.format_amount(miner_reward),
                reward = %self.currency.format_amount(reward),
                "coinbase does not use the full reward"
            );
            return None;
        }
        Some((reward, emission_change))
    }

    fn check_tx_outputs(&self, tx: &Transaction, height: u64) -> bool {
        for output in &tx.prefix.outputs {
            if output.amount == 0 {
                tracing::info!("output amount is zero");
                return false;
            }
            match &output.target {
                TransactionOutputTarget::Key(key_output) => {
                    if !key_output.key.is_valid() {
                        tracing::info!("output has invalid key");
                        return false;
                    }
                }
                TransactionOutputTarget::Multisignature(ms) => {
                    if ms.required_signatures as usize > ms.keys.len() {
                        tracing::info!("multisignature output requires more keys than it has");
                        return false;
                    }
                    if ms.keys.iter().any(|k| !k.is_valid()) {
                        tracing::info!("multisignature output has invalid key");
                        return false;
                    }
                    if !self.currency.validate_multisig_output(output.amount, ms, height) {
                        return false;
                    }
                }
            }
        }
        tx.output_amount().is_some()
    }

    /// Check every input of a transaction against current chain state.
    /// `max_used_height` receives the height of the newest referenced block.
    pub fn check_transaction_inputs(&self, tx: &Transaction, max_used_height: &mut u64) -> bool {
        let prefix_hash = tx.prefix_hash();
        *max_used_height = 0;
        let mut signature_index = 0usize;
        for input in &tx.prefix.inputs {
            match input {
                TransactionInput::Key(key_input) => {
                    if key_input.output_indexes.is_empty() {
                        tracing::info!("key input has no output references");
                        return false;
                    }
                    if self.indexes.is_key_image_spent(&key_input.key_image) {
                        tracing::debug!(
                            image = %hex::encode(&key_input.key_image.0[..8]),
                            "key image already spent"
                        );
                        return false;
                    }
                    if !self.checkpoints.is_in_checkpoint_zone(self.height()) {
                        let sigs = match tx.signatures.get(signature_index) {
                            Some(s) => s,
                            None => return false,
                        };
                        if !self.check_key_input(key_input, &prefix_hash, sigs, max_used_height) {
                            tracing::info!("failed to check key input");
                            return false;
                        }
                    }
                    signature_index += 1;
                }
                TransactionInput::Multisignature(ms_input) => {
                    if !self.checkpoints.is_in_checkpoint_zone(self.height()) {
                        let sigs = match tx.signatures.get(signature_index) {
                            Some(s) => s,
                            None => return false,
                        };
                        if !self.check_multisignature_input(ms_input, &prefix_hash, sigs) {
                            return false;
                        }
                    }
                    signature_index += 1;
                }
                TransactionInput::Base(_) => {
                    tracing::info!("unexpected coinbase input in transaction");
                    return false;
                }
            }
        }
        true
    }

    fn is_tx_spendtime_unlocked(&self, unlock_time: u64) -> bool {
        if unlock_time < self.currency.max_block_number {
            // Interpreted as a block index.
            self.height() - 1 + self.currency.locked_tx_allowed_delta_blocks >= unlock_time
        } else {
            // Interpreted as UNIX time.
            self.adjusted_time() + self.currency.locked_tx_allowed_delta_seconds >= unlock_time
        }
    }

    fn check_key_input(
        &self,
        input: &KeyInput,
        prefix_hash: &Hash,
        signatures: &[Signature],
        max_used_height: &mut u64,
    ) -> bool {
        let absolute = relative_to_absolute_offsets(&input.output_indexes);
        let mut output_keys: Vec<PublicKey> = Vec::with_capacity(absolute.len());

        let amount_outputs = match self.indexes.outputs_by_amount.get(&input.amount) {
            Some(outputs) => outputs,
            None => {
                tracing::info!(amount = input.amount, "no outputs for amount");
                return false;
            }
        };
        for global_index in &absolute {
            let (tx_index, output_index) = match amount_outputs.get(*global_index as usize) {
                Some(v) => *v,
                None => {
                    tracing::info!(
                        amount = input.amount,
                        global_index,
                        "output reference out of range"
                    );
                    return false;
                }
            };
            let entry = match self
                .store
                .get(tx_index.block as u64)
                .and_then(|b| b.transactions.get(tx_index.transaction as usize))
            {
                Some(e) => e,
                None => return false,
            };
            if !self.is_tx_spendtime_unlocked(entry.tx.prefix.unlock_time) {
                tracing::info!(
                    unlock_time = entry.tx.prefix.unlock_time,
                    "referenced output is still locked"
                );
                return false;
            }
            match entry
                .tx
                .prefix
                .outputs
                .get(output_index as usize)
                .map(|o| &o.target)
            {
                Some(TransactionOutputTarget::Key(key_output)) => {
                    output_keys.push(key_output.key)
                }
                _ => {
                    tracing::info!("referenced output has the wrong type");
                    return false;
                }
            }
            *max_used_height = (*max_used_height).max(tx_index.block as u64);
        }

        if output_keys.len() != absolute.len() {
            return false;
        }
        // Minimum ring size was enforced between the mixin fork and the
        // deposit fork.
        let tip = self.height();
        if tip > self.currency.upgrade_height_v4
            && tip < self.currency.upgrade_height_v5
            && input.output_indexes.len() < 3
        {
            tracing::error!(ring = input.output_indexes.len(), "ring size is too small");
            return false;
        }
        if signatures.len() != output_keys.len() {
            tracing::error!(
                signatures = signatures.len(),
                keys = output_keys.len(),
                "signature count mismatch"
            );
            return false;
        }
        if self.checkpoints.is_in_checkpoint_zone(self.height()) {
            return true;
        }
        if !input.key_image.is_in_main_subgroup() {
            tracing::info!("key image is not in the main subgroup");
            return false;
        }
        check_ring_signature(prefix_hash, &input.key_image, &output_keys, signatures)
    }

    fn check_multisignature_input(
        &self,
        input: &MultisignatureInput,
        prefix_hash: &Hash,
        signatures: &[Signature],
    ) -> bool {
        let usage = match self
            .indexes
            .multisig_outputs
            .get(&input.amount)
            .and_then(|outputs| outputs.get(input.output_index as usize))
        {
            Some(usage) => *usage,
            None => {
                tracing::info!(
                    amount = input.amount,
                    index = input.output_index,
                    "multisignature output reference not found"
                );
                return false;
            }
        };
        if usage.is_used {
            tracing::info!("multisignature output already spent");
            return false;
        }

        let entry = match self
            .store
            .get(usage.transaction_index.block as u64)
            .and_then(|b| b.transactions.get(usage.transaction_index.transaction as usize))
        {
            Some(e) => e,
            None => return false,
        };
        if !self.is_tx_spendtime_unlocked(entry.tx.prefix.unlock_time) {
            tracing::info!("multisignature output is still time locked");
            return false;
        }
        let output = match entry
            .tx
            .prefix
            .outputs
            .get(usage.output_index as usize)
            .map(|o| &o.target)
        {
            Some(TransactionOutputTarget::Multisignature(ms)) => ms,
            _ => return false,
        };

        if input.term != output.term {
            tracing::info!(
                input_term = input.term,
                output_term = output.term,
                "deposit term mismatch"
            );
            return false;
        }
        // A deposit spends only once its term has matured.
        if input.term != 0 {
            let creating_height = usage.transaction_index.block as u64;
            let unlock_height = creating_height + input.term as u64;
            if unlock_height > self.height().saturating_sub(1) {
                tracing::info!(unlock_height, "deposit is still locked");
                return false;
            }
        }
        if input.signature_count != output.required_signatures {
            tracing::info!("multisignature count mismatch");
            return false;
        }
        if signatures.len() != input.signature_count as usize {
            return false;
        }

        // Each signature must match a distinct output key, in key order.
        let mut signature_index = 0usize;
        let mut key_index = 0usize;
        while signature_index < signatures.len() {
            if key_index == output.keys.len() {
                tracing::info!("multisignature verification ran out of keys");
                return false;
            }
            if check_signature(
                prefix_hash,
                &output.keys[key_index],
                &signatures[signature_index],
            ) {
                signature_index += 1;
            }
            key_index += 1;
        }
        true
    }

    // ── Serving peers and the RPC facade ──

    /// Resolve a sparse locator to `(total_height, start_height, ids)` with
    /// at most `max_ids` block ids.
    pub fn handle_chain_request(
        &self,
        locator: &[Hash],
        max_ids: usize,
    ) -> Option<(u64, u64, Vec<Hash>)> {
        let start = self.store.find_supplement(locator)?;
        let ids: Vec<Hash> = (start..self.height())
            .take(max_ids)
            .filter_map(|h| self.store.hash_of(h))
            .collect();
        Some((self.height(), start, ids))
    }

    /// Blocks (with materialized transactions) by their hashes; unknown
    /// hashes are returned in `missed`.
    pub fn get_blocks_by_hash(
        &self,
        hashes: &[Hash],
        missed: &mut Vec<Hash>,
    ) -> Vec<(Block, Vec<Transaction>)> {
        let mut result = Vec::new();
        for hash in hashes {
            match self.block_by_hash(hash) {
                Some(entry) => {
                    let txs = entry
                        .transactions
                        .iter()
                        .skip(1)
                        .map(|t| t.tx.clone())
                        .collect();
                    result.push((entry.block.clone(), txs));
                }
                None => missed.push(*hash),
            }
        }
        result
    }

    /// Random unlocked key outputs for an amount, excluding the immature
    /// tail of the chain.
    pub fn random_outputs_for_amount(
        &self,
        amount: u64,
        count: usize,
    ) -> Vec<(u32, PublicKey)> {
        let outputs = match self.indexes.outputs_by_amount.get(&amount) {
            Some(outputs) => outputs,
            None => return Vec::new(),
        };
        // Outputs in the unlock tail are not yet spendable decoys.
        let allowed_end = outputs
            .iter()
            .rposition(|(tx_index, _)| {
                (tx_index.block as u64) + self.currency.mined_money_unlock_window
                    <= self.height().saturating_sub(1)
            })
            .map(|p| p + 1)
            .unwrap_or(0);
        if allowed_end == 0 {
            return Vec::new();
        }

        let mut picked = std::collections::HashSet::new();
        let mut result = Vec::new();
        let target = count.min(allowed_end);
        let mut attempts = 0;
        while result.len() < target && attempts < target * 20 {
            attempts += 1;
            let global_index = (rand::random::<u64>() % allowed_end as u64) as usize;
            if !picked.insert(global_index) {
                continue;
            }
            let (tx_index, output_index) = outputs[global_index];
            let entry = match self
                .store
                .get(tx_index.block as u64)
                .and_then(|b| b.transactions.get(tx_index.transaction as usize))
            {
                Some(e) => e,
                None => continue,
            };
            if !self.is_tx_spendtime_unlocked(entry.tx.prefix.unlock_time) {
                continue;
            }
            if let Some(TransactionOutputTarget::Key(key_output)) = entry
                .tx
                .prefix
                .outputs
                .get(output_index as usize)
                .map(|o| &o.target)
            {
                result.push((global_index as u32, key_output.key));
            }
        }
        result
    }

    // ── Persistence ──

    fn persist_tip(&self) {
        if let (Some(db), Some(entry)) = (&self.db, self.store.last()) {
            if let Err(e) = db.put_block(entry.height, entry) {
                tracing::error!(error = %e, "failed to persist block");
            }
        }
    }

    /// Serialize the engine caches and optional indices.
    pub fn store_caches(&self) {
        let db = match &self.db {
            Some(db) => db,
            None => return,
        };
        let caches = ChainCachesRecord {
            version: CHAIN_CACHES_VERSION,
            spent_key_images: self
                .indexes
                .spent_key_images
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
            transaction_map: self
                .indexes
                .transaction_map
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
            outputs_by_amount: self
                .indexes
                .outputs_by_amount
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            multisig_outputs: self
                .indexes
                .multisig_outputs
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            deposit_index: self.indexes.deposit_index.clone(),
            generated_transactions: self.indexes.generated_transactions.clone(),
        };
        if let Err(e) = db.put_caches(&caches) {
            tracing::error!(error = %e, "failed to store chain caches");
        }
        let indices = ChainIndicesRecord {
            version: CHAIN_INDICES_VERSION,
            payment_id_index: self
                .indexes
                .payment_id_index
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            timestamp_index: self
                .indexes
                .timestamp_index
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        };
        if let Err(e) = db.put_indices(&indices) {
            tracing::error!(error = %e, "failed to store chain indices");
        }
        if let Err(e) = db.flush() {
            tracing::error!(error = %e, "failed to flush chain database");
        }
    }
}

/// Net deposit amount change of a block's transactions.
fn deposit_delta_of(transactions: &[TransactionEntry]) -> i64 {
    let mut delta: i64 = 0;
    for entry in transactions {
        for input in &entry.tx.prefix.inputs {
            if let TransactionInput::Multisignature(m) = input {
                if m.term > 0 {
                    delta -= m.amount as i64;
                }
            }
        }
        for output in &entry.tx.prefix.outputs {
            if let TransactionOutputTarget::Multisignature(ms) = &output.target {
                if ms.term > 0 {
                    delta += output.amount as i64;
                }
            }
        }
    }
    delta
}

impl TransactionValidator for Blockchain {
    fn check_transaction_inputs_cached(&self, tx: &Transaction, info: &mut TxCheckInfo) -> bool {
        if info.max_used.is_empty() {
            let mut max_used_height = 0;
            if !self.check_transaction_inputs(tx, &mut max_used_height) {
                info.last_failed = BlockInfo {
                    height: self.height().saturating_sub(1),
                    id: self.tail_id(),
                };
                return false;
            }
            info.max_used = BlockInfo {
                height: max_used_height,
                id: self.store.hash_of(max_used_height).unwrap_or(crate::NULL_HASH),
            };
            true
        } else {
            if info.max_used.height >= self.height() {
                return false;
            }
            if self.store.hash_of(info.max_used.height) != Some(info.max_used.id) {
                // The chain the transaction was checked against was reorged
                // away; re-check from scratch.
                info.max_used = BlockInfo::empty();
                return self.check_transaction_inputs_cached(tx, info);
            }
            if !info.last_failed.is_empty()
                && self.store.hash_of(info.last_failed.height) == Some(info.last_failed.id)
            {
                return false;
            }
            true
        }
    }

    fn have_spent_key_images(&self, tx: &Transaction) -> bool {
        tx.key_images().any(|image| self.indexes.is_key_image_spent(image))
    }

    fn check_transaction_size(&self, blob_size: usize) -> bool {
        blob_size <= self.current_cumulative_size_limit - self.currency.coinbase_blob_reserved_size
    }

    fn tip_height(&self) -> u64 {
        self.height()
    }
}

/// The node core: pool and chain under one roof, with the pool → blockchain
/// lock order every mutation follows.
pub struct Core {
    currency: Currency,
    bus: Arc<EventBus>,
    pool: Mutex<TransactionPool>,
    chain: Mutex<Blockchain>,
}

impl Core {
    pub fn new(
        currency: Currency,
        checkpoints: Checkpoints,
        bus: Arc<EventBus>,
        db: Option<ChainDb>,
    ) -> Result<Self, BlockchainError> {
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        Self::with_time(currency, checkpoints, bus, db, time)
    }

    pub fn with_time(
        currency: Currency,
        checkpoints: Checkpoints,
        bus: Arc<EventBus>,
        db: Option<ChainDb>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, BlockchainError> {
        let chain = Blockchain::new(
            currency.clone(),
            checkpoints,
            time.clone(),
            bus.clone(),
            db,
        )?;
        let pool = TransactionPool::new(currency.clone(), time);
        Ok(Core {
            currency,
            bus,
            pool: Mutex::new(pool),
            chain: Mutex::new(chain),
        })
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Handle a block arriving from a peer or the RPC surface.
    pub fn handle_incoming_block(&self, block: Block) -> BlockVerificationContext {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let mut chain = self.chain.lock().expect("chain lock poisoned");
        let bvc = chain.add_new_block(block, &mut pool);
        if bvc.added_to_main_chain {
            let (tail, height) = chain.top_info();
            pool.on_blockchain_inc(height, tail, &*chain);
        }
        bvc
    }

    /// Handle a transaction arriving from a peer or the RPC surface.
    pub fn handle_incoming_transaction(
        &self,
        tx: Transaction,
        keep_by_block: bool,
    ) -> AddTxResult {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let chain = self.chain.lock().expect("chain lock poisoned");
        let height = chain.height();
        let result = pool.add_tx(tx.clone(), &*chain, keep_by_block, height);
        if matches!(result, AddTxResult::Added) {
            self.bus.pool_changed.publish(PoolChanged::Added(tx.hash()));
        }
        result
    }

    /// Build a mining template at the current tip.
    pub fn get_block_template(
        &self,
        miner_address: &AccountPublicAddress,
        extra_nonce: &[u8],
    ) -> Option<(Block, u64)> {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let chain = self.chain.lock().expect("chain lock poisoned");

        let height = chain.height();
        let difficulty = chain.difficulty_for_next_block();
        let median = chain
            .median_block_size()
            .max(self.currency.block_granted_full_reward_zone);
        let already_generated = chain.coins_in_circulation();
        let size_limit = chain.current_cumulative_size_limit()
            - self.currency.coinbase_blob_reserved_size;

        let (selected, txs_size, fees) =
            pool.fill_block_template(median, size_limit, height, &*chain);

        // Iterate the coinbase until its size stabilizes against the reward
        // penalty (two passes are enough for the reserved-size bound).
        let mut coinbase = self.currency.construct_miner_tx(
            height,
            median,
            already_generated,
            txs_size,
            fees,
            miner_address,
            extra_nonce,
            10,
            None,
        )?;
        let coinbase_size = coinbase.binary_size();
        coinbase = self.currency.construct_miner_tx(
            height,
            median,
            already_generated,
            txs_size + coinbase_size,
            fees,
            miner_address,
            extra_nonce,
            10,
            None,
        )?;

        let version = self.currency.block_version_for_height(height);
        Some((
            Block {
                major_version: version,
                minor_version: 0,
                timestamp: chain.adjusted_time(),
                prev_block_hash: chain.tail_id(),
                nonce: 0,
                base_transaction: coinbase,
                transaction_hashes: selected,
            },
            difficulty,
        ))
    }

    /// Periodic maintenance: expire pool transactions.
    pub fn on_idle(&self) {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let removed = pool.on_idle();
        drop(pool);
        for hash in removed {
            self.bus.pool_changed.publish(PoolChanged::Removed(hash));
        }
    }

    /// Run a closure with the chain locked (read paths).
    pub fn with_chain<R>(&self, f: impl FnOnce(&Blockchain) -> R) -> R {
        let chain = self.chain.lock().expect("chain lock poisoned");
        f(&chain)
    }

    /// Run a closure with the pool locked.
    pub fn with_pool<R>(&self, f: impl FnOnce(&TransactionPool) -> R) -> R {
        let pool = self.pool.lock().expect("pool lock poisoned");
        f(&pool)
    }

    /// Take a transaction out of the pool (lite-block recovery path).
    pub fn take_pool_transaction(&self, hash: &Hash) -> Option<Transaction> {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        pool.take_tx(hash)
    }

    /// Core sync summary exchanged in handshakes.
    pub fn sync_data(&self) -> (u64, Hash) {
        self.with_chain(|chain| (chain.height(), chain.tail_id()))
    }

    /// Persist everything on shutdown.
    pub fn save(&self) {
        let pool = self.pool.lock().expect("pool lock poisoned");
        let chain = self.chain.lock().expect("chain lock poisoned");
        chain.store_caches();
        if let Some(bytes) = pool.serialize_state() {
            let _ = chain.db.as_ref().map(|db| db.put_pool_state(&bytes));
        }
    }

    /// Restore pool state persisted by a previous run.
    pub fn load_pool_state(&self) {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let chain = self.chain.lock().expect("chain lock poisoned");
        if let Some(db) = chain.db.as_ref() {
            if let Ok(Some(bytes)) = db.get_pool_state() {
                pool.restore_state(&bytes, &*chain);
            }
        }
    }
}
