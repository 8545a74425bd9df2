//! Consensus object types: transactions, blocks, and their hashes.
//!
//! Inputs and outputs are flat sums with explicit discriminants, matched at
//! the three validation sites (type check, signature check, spend check).

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{KeyImage, PublicKey, Signature};
use crate::{cn_fast_hash, hash_concat, tree_hash, Hash};

/// Transaction format versions.
pub const TRANSACTION_VERSION_1: u8 = 1;
pub const TRANSACTION_VERSION_2: u8 = 2;

/// Extra-field tags (tag-length-value script in `extra`).
pub const EXTRA_TAG_PADDING: u8 = 0x00;
pub const EXTRA_TAG_PUBKEY: u8 = 0x01;
pub const EXTRA_TAG_NONCE: u8 = 0x02;
pub const EXTRA_TAG_MERGE_MINING: u8 = 0x03;
pub const EXTRA_TAG_TTL: u8 = 0x04;
/// Nested tag inside an extra nonce marking a payment id.
pub const EXTRA_NONCE_PAYMENT_ID: u8 = 0x00;

/// Coinbase input: mints the block reward at a height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseInput {
    pub block_index: u64,
}

/// Ring-signed spend of a key output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInput {
    pub amount: u64,
    /// Relative offsets into `outputs_by_amount[amount]`; the first is
    /// absolute, each following one is a delta.
    pub output_indexes: Vec<u32>,
    pub key_image: KeyImage,
}

impl KeyInput {
    /// Ring decoys referenced beyond the real output.
    pub fn mixin(&self) -> usize {
        self.output_indexes.len().saturating_sub(1)
    }
}

/// Spend of a multisignature output. `term > 0` marks a deposit withdrawal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisignatureInput {
    pub amount: u64,
    pub signature_count: u8,
    /// Global index into `multisig_outputs[amount]`.
    pub output_index: u32,
    pub term: u32,
}

/// Transaction input sum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionInput {
    Base(BaseInput),
    Key(KeyInput),
    Multisignature(MultisignatureInput),
}

/// Single-key output target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutput {
    pub key: PublicKey,
}

/// Multisignature output target. `term > 0` marks a deposit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisignatureOutput {
    pub keys: Vec<PublicKey>,
    pub required_signatures: u8,
    pub term: u32,
}

/// Transaction output target sum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutputTarget {
    Key(KeyOutput),
    Multisignature(MultisignatureOutput),
}

/// An output: an amount bound to a spend condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub amount: u64,
    pub target: TransactionOutputTarget,
}

/// The signed-over portion of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPrefix {
    pub version: u8,
    /// Block index if below `MAX_BLOCK_NUMBER`, otherwise a UNIX timestamp.
    pub unlock_time: u64,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub extra: Vec<u8>,
}

/// A full transaction: prefix plus witness.
///
/// `signatures[i]` holds a ring signature per key input (one entry per ring
/// member) or up to `required_signatures` entries for a multisignature
/// input. Coinbase transactions carry at most one empty group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    pub signatures: Vec<Vec<Signature>>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        codec::object_hash(self)
    }

    /// Hash of the prefix alone, the message signed by every input.
    pub fn prefix_hash(&self) -> Hash {
        codec::object_hash(&self.prefix)
    }

    pub fn binary_size(&self) -> usize {
        codec::binary_size(self)
    }

    pub fn is_coinbase(&self) -> bool {
        self.prefix.inputs.len() == 1
            && matches!(self.prefix.inputs[0], TransactionInput::Base(_))
    }

    /// Sum of output amounts; `None` on overflow.
    pub fn output_amount(&self) -> Option<u64> {
        self.prefix
            .outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Key images of all key inputs, in input order.
    pub fn key_images(&self) -> impl Iterator<Item = &KeyImage> {
        self.prefix.inputs.iter().filter_map(|i| match i {
            TransactionInput::Key(k) => Some(&k.key_image),
            _ => None,
        })
    }

    /// Transaction public key from `extra`, if present.
    pub fn tx_public_key(&self) -> Option<PublicKey> {
        parse_extra(&self.prefix.extra).public_key
    }

    /// Payment id from the extra nonce, if present.
    pub fn payment_id(&self) -> Option<Hash> {
        parse_extra(&self.prefix.extra).payment_id
    }

    /// Time-to-live (UNIX seconds) from `extra`, if present.
    pub fn ttl(&self) -> Option<u64> {
        parse_extra(&self.prefix.extra).ttl
    }

    /// Whether the coinbase extra carries a merge-mining tag.
    pub fn has_merge_mining_tag(&self) -> bool {
        parse_extra(&self.prefix.extra).has_merge_mining_tag
    }
}

/// Fields recovered from an `extra` byte script.
#[derive(Default)]
pub struct ParsedExtra {
    pub public_key: Option<PublicKey>,
    pub payment_id: Option<Hash>,
    pub ttl: Option<u64>,
    pub has_merge_mining_tag: bool,
}

/// Walk the tag-length-value script. Unknown tags stop the walk (their
/// length is unknowable); malformed fields are ignored rather than fatal,
/// matching the permissive read semantics of the wire format.
pub fn parse_extra(extra: &[u8]) -> ParsedExtra {
    let mut parsed = ParsedExtra::default();
    let mut pos = 0usize;
    while pos < extra.len() {
        match extra[pos] {
            EXTRA_TAG_PADDING => pos += 1,
            EXTRA_TAG_PUBKEY => {
                if pos + 33 > extra.len() {
                    break;
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(&extra[pos + 1..pos + 33]);
                parsed.public_key = Some(PublicKey(key));
                pos += 33;
            }
            EXTRA_TAG_NONCE => {
                if pos + 2 > extra.len() {
                    break;
                }
                let len = extra[pos + 1] as usize;
                if pos + 2 + len > extra.len() {
                    break;
                }
                let nonce = &extra[pos + 2..pos + 2 + len];
                if len == 33 && nonce[0] == EXTRA_NONCE_PAYMENT_ID {
                    let mut id = [0u8; 32];
                    id.copy_from_slice(&nonce[1..33]);
                    parsed.payment_id = Some(id);
                }
                pos += 2 + len;
            }
            EXTRA_TAG_MERGE_MINING => {
                parsed.has_merge_mining_tag = true;
                if pos + 2 > extra.len() {
                    break;
                }
                let len = extra[pos + 1] as usize;
                pos += 2 + len;
            }
            EXTRA_TAG_TTL => {
                if pos + 9 > extra.len() {
                    break;
                }
                let mut ttl = [0u8; 8];
                ttl.copy_from_slice(&extra[pos + 1..pos + 9]);
                parsed.ttl = Some(u64::from_le_bytes(ttl));
                pos += 9;
            }
            _ => break,
        }
    }
    parsed
}

/// Append a transaction public key to an extra script.
pub fn add_tx_public_key_to_extra(extra: &mut Vec<u8>, key: &PublicKey) {
    extra.push(EXTRA_TAG_PUBKEY);
    extra.extend_from_slice(&key.0);
}

/// Append a payment-id nonce to an extra script.
pub fn add_payment_id_to_extra(extra: &mut Vec<u8>, payment_id: &Hash) {
    extra.push(EXTRA_TAG_NONCE);
    extra.push(33);
    extra.push(EXTRA_NONCE_PAYMENT_ID);
    extra.extend_from_slice(payment_id);
}

/// Append a TTL to an extra script.
pub fn add_ttl_to_extra(extra: &mut Vec<u8>, ttl: u64) {
    extra.push(EXTRA_TAG_TTL);
    extra.extend_from_slice(&ttl.to_le_bytes());
}

/// A block: header plus coinbase plus ordered transaction hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: u64,
    pub prev_block_hash: Hash,
    pub nonce: u32,
    pub base_transaction: Transaction,
    pub transaction_hashes: Vec<Hash>,
}

/// Hash input of a block: header fields bound to the transaction tree root.
#[derive(Serialize)]
struct BlockHashingBlob<'a> {
    major_version: u8,
    minor_version: u8,
    timestamp: u64,
    prev_block_hash: &'a Hash,
    nonce: u32,
    tree_root: Hash,
    transaction_count: u64,
}

impl Block {
    /// Height encoded in the coinbase input, or `None` for a malformed base
    /// transaction.
    pub fn height(&self) -> Option<u64> {
        match self.base_transaction.prefix.inputs.first() {
            Some(TransactionInput::Base(base)) => Some(base.block_index),
            _ => None,
        }
    }

    fn hashing_blob(&self) -> Vec<u8> {
        let mut leaves = Vec::with_capacity(1 + self.transaction_hashes.len());
        leaves.push(self.base_transaction.hash());
        leaves.extend_from_slice(&self.transaction_hashes);
        let blob = BlockHashingBlob {
            major_version: self.major_version,
            minor_version: self.minor_version,
            timestamp: self.timestamp,
            prev_block_hash: &self.prev_block_hash,
            nonce: self.nonce,
            tree_root: tree_hash(&leaves),
            transaction_count: leaves.len() as u64,
        };
        codec::to_binary(&blob)
            .expect("block hashing blob is a fixed-shape record far under the codec limit")
    }

    /// Block identity hash.
    pub fn hash(&self) -> Hash {
        cn_fast_hash(&self.hashing_blob())
    }

    /// Proof-of-work hash of the block. The production slow hash is an
    /// external primitive; this node domain-separates the fast hash in its
    /// place, preserving the contract that the PoW digest is independent of
    /// the identity hash.
    pub fn proof_of_work_hash(&self) -> Hash {
        hash_concat(&[b"slow-hash", &self.hashing_blob()])
    }
}

/// Check a proof-of-work digest against a difficulty.
///
/// The digest, read as a little-endian 256-bit integer, satisfies difficulty
/// `d` when `digest * d < 2^256`, i.e. the 4-limb school multiplication
/// produces no final carry.
pub fn check_hash(hash: &Hash, difficulty: u64) -> bool {
    if difficulty == 0 {
        return false;
    }
    let mut limbs = [0u64; 4];
    for (i, limb) in limbs.iter_mut().enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash[i * 8..(i + 1) * 8]);
        *limb = u64::from_le_bytes(bytes);
    }
    let mut carry: u128 = 0;
    for limb in limbs {
        carry = (limb as u128) * (difficulty as u128) + (carry >> 64);
    }
    (carry >> 64) == 0
}

/// Expand relative output offsets to absolute global indexes.
pub fn relative_to_absolute_offsets(relative: &[u32]) -> Vec<u32> {
    let mut absolute = Vec::with_capacity(relative.len());
    let mut acc = 0u32;
    for (i, &off) in relative.iter().enumerate() {
        acc = if i == 0 { off } else { acc.wrapping_add(off) };
        absolute.push(acc);
    }
    absolute
}

/// Compress absolute global indexes (must be sorted ascending) to offsets.
pub fn absolute_to_relative_offsets(absolute: &[u32]) -> Vec<u32> {
    let mut relative = Vec::with_capacity(absolute.len());
    let mut prev = 0u32;
    for (i, &idx) in absolute.iter().enumerate() {
        relative.push(if i == 0 { idx } else { idx - prev });
        prev = idx;
    }
    relative
}

/// Location of a transaction in the block log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionIndex {
    pub block: u32,
    pub transaction: u16,
}

/// A stored transaction with the global indexes its outputs were assigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub tx: Transaction,
    pub global_output_indexes: Vec<u32>,
}

/// A block as stored in the chain: materialized transactions plus running
/// totals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block: Block,
    pub height: u64,
    pub block_cumulative_size: usize,
    pub cumulative_difficulty: u64,
    pub already_generated_coins: u64,
    /// Coinbase first, then the listed transactions in order.
    pub transactions: Vec<TransactionEntry>,
}
