//! # Peridot
//!
//! A CryptoNote-family proof-of-work cryptocurrency node with:
//! - **Time-locked deposits** — multisignature outputs with a term that accrue
//!   currency-defined interest, spendable once the term matures
//! - **Ring-signature privacy** — one-time keys, key images for double-spend
//!   detection without revealing the spent output
//! - **Versioned consensus** — block major version selects validation rules,
//!   difficulty algorithm and deposit schedule
//! - **Full P2P stack** — Levin-framed transport, white/gray/anchor peer
//!   lists, lite-block relay with missing-transaction recovery
//! - **Wallet synchronization** — per-account output scanning with deposit
//!   lifecycle tracking

pub mod blockchain;
pub mod checkpoints;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod currency;
pub mod observers;
pub mod p2p;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod transfers;
pub mod wallet;

/// Protocol constants. Consensus-critical values must not be changed without
/// a scheduled upgrade height.
pub mod constants {
    /// Smallest atomic unit: 1 PRD = 1_000_000 units (6 decimal places).
    pub const COIN: u64 = 1_000_000;
    /// Thousandth of a coin, used by the reward step table.
    pub const POINT: u64 = 1_000;
    /// Total money supply cap in atomic units.
    pub const MONEY_SUPPLY: u64 = 9_999_000_000_000_000;
    /// Reward of the earliest blocks, in POINT units.
    pub const START_BLOCK_REWARD: u64 = 5_000 * POINT;
    /// Fixed reward of heights 1..=100, locked to secure the network.
    pub const FOUNDATION_TRUST: u64 = 1_000_000 * COIN;
    /// Reward cap before the halving fork.
    pub const MAX_BLOCK_REWARD: u64 = 15 * COIN;
    /// Reward cap at and after the halving fork (major version 8).
    pub const MAX_BLOCK_REWARD_V1: u64 = 6 * COIN;
    /// Reward cap after the swap fork (major version 9).
    pub const MAX_BLOCK_REWARD_V2: u64 = 12 * COIN;
    /// Blocks between reward-step increases (≈ one month).
    pub const REWARD_INCREASE_INTERVAL: u64 = 21_900;

    /// Unlock times below this value are block indexes, above it UNIX time.
    pub const MAX_BLOCK_NUMBER: u64 = 500_000_000;
    /// Blocks a coinbase output stays locked after being mined.
    pub const MINED_MONEY_UNLOCK_WINDOW: u64 = 10;
    /// Minimum age in blocks of a referenced coinbase output.
    pub const TX_SPENDABLE_AGE: u64 = 10;
    /// Slack added to block-index unlock comparisons.
    pub const LOCKED_TX_ALLOWED_DELTA_BLOCKS: u64 = 1;
    /// Slack added to timestamp unlock comparisons.
    pub const LOCKED_TX_ALLOWED_DELTA_SECONDS: u64 = DIFFICULTY_TARGET * LOCKED_TX_ALLOWED_DELTA_BLOCKS;
    /// Maximum seconds a block timestamp may lie in the future.
    pub const BLOCK_FUTURE_TIME_LIMIT: u64 = 60 * 60 * 2;
    /// Tightened future-time limit once LWMA3 activates.
    pub const BLOCK_FUTURE_TIME_LIMIT_V1: u64 = 360;
    /// Blocks whose timestamps feed the median timestamp check.
    pub const TIMESTAMP_CHECK_WINDOW: usize = 30;
    /// Tightened median window once LWMA3 activates.
    pub const TIMESTAMP_CHECK_WINDOW_V1: usize = 11;

    /// Target seconds between blocks.
    pub const DIFFICULTY_TARGET: u64 = 120;
    /// Expected blocks per day at target rate.
    pub const EXPECTED_BLOCKS_PER_DAY: u64 = 24 * 60 * 60 / DIFFICULTY_TARGET;
    /// Classic difficulty window.
    pub const DIFFICULTY_WINDOW: usize = EXPECTED_BLOCKS_PER_DAY as usize;
    /// LWMA difficulty window (N).
    pub const DIFFICULTY_WINDOW_V3: usize = 60;
    /// Timestamps cut from each end after sorting (classic algorithm).
    pub const DIFFICULTY_CUT: usize = 60;
    /// Number of (timestamp, cumulative difficulty) samples for LWMA: N + 1.
    pub const DIFFICULTY_BLOCKS_COUNT: usize = DIFFICULTY_WINDOW_V3 + 1;

    /// Median window of recent block sizes used for the reward penalty.
    pub const REWARD_BLOCKS_WINDOW: usize = 100;
    /// Block size granted full reward before the penalty applies.
    pub const BLOCK_GRANTED_FULL_REWARD_ZONE: usize = 100_000;
    /// Bytes reserved in a block template for the coinbase transaction.
    pub const COINBASE_BLOB_RESERVED_SIZE: usize = 600;
    /// Display decimal places.
    pub const DISPLAY_DECIMAL_POINT: usize = 6;
    /// Initial hard cap on cumulative block size.
    pub const MAX_BLOCK_SIZE_INITIAL: usize = BLOCK_GRANTED_FULL_REWARD_ZONE * 10;
    /// Cumulative block size growth: numerator bytes per denominator blocks.
    pub const MAX_BLOCK_SIZE_GROWTH_NUMERATOR: u64 = 100 * 1024;
    /// Cumulative block size growth denominator (blocks per year).
    pub const MAX_BLOCK_SIZE_GROWTH_DENOMINATOR: u64 = 365 * 24 * 60 * 60 / DIFFICULTY_TARGET;

    /// Minimum transaction fee.
    pub const MINIMUM_FEE: u64 = 10;
    /// Minimum fee after the first fee fork.
    pub const MINIMUM_FEE_V1: u64 = 100;
    /// Minimum fee after the second fee fork, also used for deposits.
    pub const MINIMUM_FEE_V2: u64 = 1_000;
    /// Outputs below this value are dust and excluded from decomposition.
    pub const DEFAULT_DUST_THRESHOLD: u64 = 10;

    /// Minimum amount of a deposit output.
    pub const DEPOSIT_MIN_AMOUNT: u64 = COIN;
    /// Minimum legacy deposit term (one week of blocks).
    pub const DEPOSIT_MIN_TERM: u32 = 5_040;
    /// Maximum legacy deposit term (one year of blocks).
    pub const DEPOSIT_MAX_TERM: u32 = 12 * 21_900;
    /// Maximum term of first-fork deposits (five years).
    pub const DEPOSIT_MAX_TERM_V1: u32 = 64_800 * 20;
    /// Minimum monthly-deposit term (one month of blocks).
    pub const DEPOSIT_MIN_TERM_V3: u32 = 21_900;
    /// Maximum monthly-deposit term (one year of blocks).
    pub const DEPOSIT_MAX_TERM_V3: u32 = 12 * 21_900;
    /// Height activating monthly deposits.
    pub const DEPOSIT_HEIGHT_V3: u64 = 580;
    /// Height from which deposit terms are strictly enforced.
    pub const DEPOSIT_HEIGHT_V4: u64 = 610;
    /// Legacy rate factor subtracted in the V1 interest formula.
    pub const DEPOSIT_MIN_TOTAL_RATE_FACTOR: u64 = 0;
    /// Legacy maximum total rate multiplier.
    pub const DEPOSIT_MAX_TOTAL_RATE: u64 = 4;
    /// Early-deposit interest multiplier.
    pub const MULTIPLIER_FACTOR: u64 = 100;
    /// Last height eligible for the early-deposit multiplier.
    pub const END_MULTIPLIER_BLOCK: u64 = 101;
    /// Height whose deposit withdrawals compute interest against the current
    /// height instead of the lock height. Zero disables the remap. Consensus
    /// compatibility knob; do not change.
    pub const BLOCK_WITH_MISSING_INTEREST: u64 = 0;

    /// Upgrade heights: block major version N applies above `UPGRADE_HEIGHT_VN`.
    pub const UPGRADE_HEIGHT_V2: u64 = 1;
    pub const UPGRADE_HEIGHT_V3: u64 = 101;
    pub const UPGRADE_HEIGHT_V4: u64 = 201;
    pub const UPGRADE_HEIGHT_V5: u64 = 301;
    pub const UPGRADE_HEIGHT_V6: u64 = 401;
    pub const UPGRADE_HEIGHT_V7: u64 = 501;
    pub const UPGRADE_HEIGHT_V8: u64 = 601;
    pub const UPGRADE_HEIGHT_V9: u64 = 6_000;

    /// Seconds a regular transaction may live in the pool.
    pub const MEMPOOL_TX_LIVETIME: u64 = 60 * 60 * 12;
    /// Seconds a transaction returned from an alternative block may live.
    pub const MEMPOOL_TX_FROM_ALT_BLOCK_LIVETIME: u64 = 60 * 60 * 12;
    /// Deleted tx hashes are remembered for this many livetime periods.
    pub const FORGET_TX_PERIODS: u64 = 7;

    /// Maximum byte size of a fusion transaction.
    pub const FUSION_TX_MAX_SIZE: usize = BLOCK_GRANTED_FULL_REWARD_ZONE * 30 / 100;
    /// Minimum inputs a fusion transaction must consume.
    pub const FUSION_TX_MIN_INPUT_COUNT: usize = 12;
    /// Minimum input/output count ratio of a fusion transaction.
    pub const FUSION_TX_MIN_IN_OUT_COUNT_RATIO: usize = 4;

    /// Maximum size of a non-coinbase transaction.
    pub const MAX_TX_SIZE_LIMIT: usize =
        BLOCK_GRANTED_FULL_REWARD_ZONE - COINBASE_BLOB_RESERVED_SIZE;

    /// Public address prefix.
    pub const PUBLIC_ADDRESS_PREFIX: u64 = 0x3119;

    /// Genesis block parameters. The coinbase blob is compiled in so the
    /// genesis hash is identical on every node.
    pub const GENESIS_TIMESTAMP: u64 = 1_673_183_142;
    pub const GENESIS_NONCE: u32 = 7_000;

    /// Default number of block ids in a sync request.
    pub const BLOCKS_IDS_SYNCHRONIZING_DEFAULT_COUNT: usize = 10_000;
    /// Default number of blocks pulled per object-request window.
    pub const BLOCKS_SYNCHRONIZING_DEFAULT_COUNT: usize = 128;
    /// Maximum objects served per get-objects request.
    pub const COMMAND_GET_OBJECTS_MAX_COUNT: usize = 1_000;

    /// Current P2P protocol version.
    pub const P2P_CURRENT_VERSION: u8 = 3;
    /// Minimum peer protocol version accepted during handshake.
    pub const P2P_MINIMUM_VERSION: u8 = 1;
    /// Minimum peer version for lite-block propagation.
    pub const P2P_LITE_BLOCKS_PROPAGATION_VERSION: u8 = 3;
    /// Default P2P listen port.
    pub const P2P_DEFAULT_PORT: u16 = 16_000;
    /// Default RPC listen port.
    pub const RPC_DEFAULT_PORT: u16 = 17_000;
    /// White peer list capacity.
    pub const P2P_LOCAL_WHITE_PEERLIST_LIMIT: usize = 1_000;
    /// Gray peer list capacity.
    pub const P2P_LOCAL_GRAY_PEERLIST_LIMIT: usize = 5_000;
    /// Anchor peer list capacity.
    pub const P2P_ANCHOR_CONNECTIONS_COUNT: usize = 2;
    /// Target outbound connection count.
    pub const P2P_CONNECTIONS_COUNT: usize = 8;
    /// Percentage of outbound slots biased toward the white list.
    pub const P2P_WHITELIST_CONNECTIONS_PERCENT: usize = 70;
    /// Per-connection outgoing write buffer cap; exceeding it interrupts.
    pub const P2P_CONNECTION_MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;
    /// Maximum framed packet size.
    pub const P2P_PACKET_MAX_SIZE: u64 = 50_000_000;
    /// Maximum peer list entries exchanged in a handshake or timed sync.
    pub const P2P_PEERS_IN_HANDSHAKE: usize = 250;
    /// Outbound TCP connect timeout in milliseconds.
    pub const P2P_CONNECTION_TIMEOUT_MS: u64 = 5_000;
    /// Back-ping connect timeout in milliseconds.
    pub const P2P_PING_CONNECTION_TIMEOUT_MS: u64 = 2_000;
    /// Single invoke (request/response) timeout in milliseconds.
    pub const P2P_INVOKE_TIMEOUT_MS: u64 = 60 * 2 * 1_000;
    /// Handshake invoke timeout in milliseconds.
    pub const P2P_HANDSHAKE_INVOKE_TIMEOUT_MS: u64 = 5_000;
    /// Seconds between timed-sync rounds.
    pub const P2P_HANDSHAKE_INTERVAL_SECS: u64 = 60;
    /// Fail score at which a peer connection is dropped and cooled off.
    pub const P2P_FAIL_SCORE_THRESHOLD: u32 = 3;
    /// Seconds a dropped peer stays blacklisted.
    pub const P2P_IP_BLOCK_SECS: u64 = 60 * 10;

    /// Seed nodes consulted when the white list is empty.
    pub const SEED_NODES: [&str; 3] = [
        "23.92.65.226:16000",
        "107.155.108.173:16000",
        "104.251.217.80:16000",
    ];

    /// Chain autosave interval in blocks.
    pub const AUTOSAVE_INTERVAL_BLOCKS: u64 = 720;
}

/// 32-byte hash used throughout the protocol.
pub type Hash = [u8; 32];

/// The all-zero hash, used as a null sentinel.
pub const NULL_HASH: Hash = [0u8; 32];

/// Compute the CryptoNote fast hash (Keccak-256) of a byte slice.
pub fn cn_fast_hash(data: &[u8]) -> Hash {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute a Keccak-256 hash over length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g. `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Root of the transaction tree hash over a list of hashes.
///
/// Leaves are paired bottom-up; an odd tail is carried. An empty list hashes
/// to `NULL_HASH`, a single element is its own root.
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => NULL_HASH,
        1 => hashes[0],
        _ => {
            let mut layer: Vec<Hash> = hashes.to_vec();
            while layer.len() > 1 {
                let mut next = Vec::with_capacity(layer.len().div_ceil(2));
                for pair in layer.chunks(2) {
                    if pair.len() == 2 {
                        next.push(hash_concat(&[&pair[0], &pair[1]]));
                    } else {
                        next.push(pair[0]);
                    }
                }
                layer = next;
            }
            layer[0]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_hash_is_keccak() {
        // Keccak-256 of the empty string.
        let h = cn_fast_hash(b"");
        assert_eq!(
            hex::encode(h),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn hash_concat_is_length_prefixed() {
        let a = hash_concat(&[b"AB", b"C"]);
        let b = hash_concat(&[b"A", b"BC"]);
        assert_ne!(a, b);
    }

    #[test]
    fn tree_hash_degenerate_cases() {
        assert_eq!(tree_hash(&[]), NULL_HASH);
        let one = cn_fast_hash(b"x");
        assert_eq!(tree_hash(&[one]), one);
        let two = tree_hash(&[one, one]);
        assert_eq!(two, hash_concat(&[&one, &one]));
    }

    #[test]
    fn tree_hash_odd_count_carries_tail() {
        let h: Vec<Hash> = (0u8..5).map(|i| cn_fast_hash(&[i])).collect();
        let root = tree_hash(&h);
        let l0 = hash_concat(&[&h[0], &h[1]]);
        let l1 = hash_concat(&[&h[2], &h[3]]);
        let m0 = hash_concat(&[&l0, &l1]);
        assert_eq!(root, hash_concat(&[&m0, &h[4]]));
    }
}
