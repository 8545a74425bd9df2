//! Persistent storage for chain data.
//!
//! One sled database holds a tree per logical file of the node's data
//! directory: the raw block log, the serialized engine caches, the optional
//! explorer indices, the mempool state and the peer-list state. Cache
//! records are versioned; a version mismatch discards the record and the
//! caller rebuilds from the block log.

use serde::{Deserialize, Serialize};

use crate::blockchain::block::{BlockEntry, TransactionIndex};
use crate::blockchain::indexes::{DepositIndex, MultisigOutputUsage};
use crate::codec;
use crate::crypto::KeyImage;
use crate::Hash;

/// Version of the serialized engine caches.
pub const CHAIN_CACHES_VERSION: u32 = 5;
/// Version of the optional explorer indices record.
pub const CHAIN_INDICES_VERSION: u32 = 1;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<codec::CodecError> for StorageError {
    fn from(e: codec::CodecError) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

fn io_err(e: sled::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// Serialized engine caches (the `blockscache` record).
#[derive(Serialize, Deserialize)]
pub struct ChainCachesRecord {
    pub version: u32,
    pub spent_key_images: Vec<(KeyImage, u64)>,
    pub transaction_map: Vec<(Hash, TransactionIndex)>,
    pub outputs_by_amount: Vec<(u64, Vec<(TransactionIndex, u16)>)>,
    pub multisig_outputs: Vec<(u64, Vec<MultisigOutputUsage>)>,
    pub deposit_index: DepositIndex,
    pub generated_transactions: Vec<u64>,
}

/// Serialized optional indices (the `blockchainindices` record).
#[derive(Serialize, Deserialize)]
pub struct ChainIndicesRecord {
    pub version: u32,
    pub payment_id_index: Vec<(Hash, Vec<Hash>)>,
    pub timestamp_index: Vec<(u64, Vec<Hash>)>,
}

/// Sled-backed chain database.
pub struct ChainDb {
    #[allow(dead_code)]
    db: sled::Db,
    blocks: sled::Tree,
    chain_caches: sled::Tree,
    chain_indices: sled::Tree,
    pool_state: sled::Tree,
    p2p_state: sled::Tree,
}

impl ChainDb {
    /// Open or create the database at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(io_err)?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(io_err)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks").map_err(io_err)?;
        let chain_caches = db.open_tree("blockscache").map_err(io_err)?;
        let chain_indices = db.open_tree("blockchainindices").map_err(io_err)?;
        let pool_state = db.open_tree("poolstate").map_err(io_err)?;
        let p2p_state = db.open_tree("p2pstate").map_err(io_err)?;
        Ok(ChainDb {
            db,
            blocks,
            chain_caches,
            chain_indices,
            pool_state,
            p2p_state,
        })
    }

    pub fn put_block(&self, height: u64, entry: &BlockEntry) -> Result<(), StorageError> {
        let bytes = codec::to_binary(entry)?;
        self.blocks
            .insert(height.to_be_bytes(), bytes)
            .map_err(io_err)?;
        Ok(())
    }

    pub fn get_block(&self, height: u64) -> Result<Option<BlockEntry>, StorageError> {
        match self.blocks.get(height.to_be_bytes()).map_err(io_err)? {
            Some(bytes) => Ok(Some(codec::from_binary(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_block(&self, height: u64) -> Result<(), StorageError> {
        self.blocks.remove(height.to_be_bytes()).map_err(io_err)?;
        Ok(())
    }

    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Load the whole block log in height order.
    pub fn load_blocks(&self) -> Result<Vec<BlockEntry>, StorageError> {
        let mut entries = Vec::with_capacity(self.blocks.len());
        for item in self.blocks.iter() {
            let (_, bytes) = item.map_err(io_err)?;
            entries.push(codec::from_binary::<BlockEntry>(&bytes)?);
        }
        entries.sort_by_key(|e| e.height);
        Ok(entries)
    }

    pub fn put_caches(&self, record: &ChainCachesRecord) -> Result<(), StorageError> {
        let bytes = codec::to_binary(record)?;
        self.chain_caches.insert(b"caches", bytes).map_err(io_err)?;
        Ok(())
    }

    /// Load the caches record; a version mismatch reads as absent.
    pub fn get_caches(&self) -> Result<Option<ChainCachesRecord>, StorageError> {
        match self.chain_caches.get(b"caches").map_err(io_err)? {
            Some(bytes) => match codec::from_binary::<ChainCachesRecord>(&bytes) {
                Ok(record) if record.version == CHAIN_CACHES_VERSION => Ok(Some(record)),
                Ok(record) => {
                    tracing::warn!(
                        found = record.version,
                        expected = CHAIN_CACHES_VERSION,
                        "chain caches version mismatch, rebuilding"
                    );
                    Ok(None)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "chain caches unreadable, rebuilding");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn put_indices(&self, record: &ChainIndicesRecord) -> Result<(), StorageError> {
        let bytes = codec::to_binary(record)?;
        self.chain_indices
            .insert(b"indices", bytes)
            .map_err(io_err)?;
        Ok(())
    }

    pub fn get_indices(&self) -> Result<Option<ChainIndicesRecord>, StorageError> {
        match self.chain_indices.get(b"indices").map_err(io_err)? {
            Some(bytes) => match codec::from_binary::<ChainIndicesRecord>(&bytes) {
                Ok(record) if record.version == CHAIN_INDICES_VERSION => Ok(Some(record)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn put_pool_state(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.pool_state.insert(b"pool", bytes).map_err(io_err)?;
        Ok(())
    }

    pub fn get_pool_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .pool_state
            .get(b"pool")
            .map_err(io_err)?
            .map(|v| v.to_vec()))
    }

    pub fn put_p2p_state(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.p2p_state.insert(b"p2p", bytes).map_err(io_err)?;
        Ok(())
    }

    pub fn get_p2p_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .p2p_state
            .get(b"p2p")
            .map_err(io_err)?
            .map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(io_err)?;
        Ok(())
    }
}
