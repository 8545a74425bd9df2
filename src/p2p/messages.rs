//! P2P command payloads.
//!
//! Command ids live in two ranges: peer-management commands at 1000+ and
//! chain-protocol notifications at 2000+. Every payload is a serde record
//! carried in a Levin frame; unknown fields are tolerated by the codec's
//! permissive decoding of versioned records.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::blockchain::block::{Block, Transaction};
use crate::p2p::PeerId;
use crate::Hash;

pub const COMMAND_HANDSHAKE: u32 = 1001;
pub const COMMAND_TIMED_SYNC: u32 = 1002;
pub const COMMAND_PING: u32 = 1003;

pub const NOTIFY_NEW_BLOCK: u32 = 2001;
pub const NOTIFY_NEW_TRANSACTIONS: u32 = 2002;
pub const NOTIFY_REQUEST_GET_OBJECTS: u32 = 2003;
pub const NOTIFY_RESPONSE_GET_OBJECTS: u32 = 2004;
pub const NOTIFY_REQUEST_CHAIN: u32 = 2006;
pub const NOTIFY_RESPONSE_CHAIN_ENTRY: u32 = 2007;
pub const NOTIFY_REQUEST_TX_POOL: u32 = 2008;
pub const NOTIFY_NEW_LITE_BLOCK: u32 = 2009;
pub const NOTIFY_MISSING_TXS: u32 = 2010;

/// The ping success sentinel.
pub const PING_OK_RESPONSE_STATUS: u32 = 1;

/// A peer's view of its chain, exchanged on handshake and timed sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSyncData {
    pub current_height: u64,
    pub top_id: Hash,
}

/// Identity a node presents to its peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicNodeData {
    pub network_id: [u8; 16],
    pub version: u8,
    pub peer_id: PeerId,
    pub local_time: u64,
    pub my_port: u16,
}

/// A peer list entry as shared over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerlistEntry {
    pub address: SocketAddr,
    pub id: PeerId,
    pub last_seen: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_data: BasicNodeData,
    pub payload_data: CoreSyncData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_data: BasicNodeData,
    pub payload_data: CoreSyncData,
    pub local_peerlist: Vec<PeerlistEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimedSyncRequest {
    pub payload_data: CoreSyncData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimedSyncResponse {
    pub local_time: u64,
    pub payload_data: CoreSyncData,
    pub local_peerlist: Vec<PeerlistEntry>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PingRequest;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: u32,
    pub peer_id: PeerId,
}

/// Full block relay: the block plus every listed transaction body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBlockNotification {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub current_blockchain_height: u64,
    pub hop: u32,
}

/// Transaction relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTransactionsNotification {
    pub transactions: Vec<Transaction>,
}

/// Pull request for blocks and transactions by hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestGetObjects {
    pub blocks: Vec<Hash>,
    pub txs: Vec<Hash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseGetObjects {
    pub blocks: Vec<(Block, Vec<Transaction>)>,
    pub txs: Vec<Transaction>,
    pub missed_ids: Vec<Hash>,
    pub current_blockchain_height: u64,
}

/// Sparse-locator chain probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestChain {
    pub block_ids: Vec<Hash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseChainEntry {
    pub start_height: u64,
    pub total_height: u64,
    pub block_ids: Vec<Hash>,
}

/// Pool reconciliation: hashes the requester already has.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestTxPool {
    pub txs: Vec<Hash>,
}

/// Lite block relay: header and hashes only, bodies resolved from the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewLiteBlockNotification {
    pub block: Block,
    pub current_blockchain_height: u64,
    pub hop: u32,
}

/// Bodies the lite-block receiver could not resolve locally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MissingTxsNotification {
    pub block_hash: Hash,
    pub current_blockchain_height: u64,
    pub missing_txs: Vec<Hash>,
}

/// Persisted P2P identity and peer lists (`p2pstate`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2pStateRecord {
    pub version: u32,
    pub peer_id: PeerId,
    pub white: Vec<PeerlistEntry>,
    pub gray: Vec<PeerlistEntry>,
    pub anchor: Vec<(SocketAddr, PeerId, u64)>,
}

pub const P2P_STATE_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn handshake_roundtrip() {
        let req = HandshakeRequest {
            node_data: BasicNodeData {
                network_id: crate::p2p::NETWORK_ID,
                version: crate::constants::P2P_CURRENT_VERSION,
                peer_id: 42,
                local_time: 1_700_000_000,
                my_port: 16_000,
            },
            payload_data: CoreSyncData {
                current_height: 10,
                top_id: [7u8; 32],
            },
        };
        let bytes = codec::to_binary(&req).unwrap();
        let back: HandshakeRequest = codec::from_binary(&bytes).unwrap();
        assert_eq!(back.node_data, req.node_data);
        assert_eq!(back.payload_data, req.payload_data);
    }

    #[test]
    fn peerlist_entry_roundtrip() {
        let entry = PeerlistEntry {
            address: "10.0.0.1:16000".parse().unwrap(),
            id: 99,
            last_seen: 123,
        };
        let bytes = codec::to_binary(&entry).unwrap();
        let back: PeerlistEntry = codec::from_binary(&bytes).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn chain_entry_roundtrip() {
        let entry = ResponseChainEntry {
            start_height: 5,
            total_height: 100,
            block_ids: vec![[1u8; 32], [2u8; 32]],
        };
        let bytes = codec::to_binary(&entry).unwrap();
        let back: ResponseChainEntry = codec::from_binary(&bytes).unwrap();
        assert_eq!(back.start_height, 5);
        assert_eq!(back.total_height, 100);
        assert_eq!(back.block_ids.len(), 2);
    }

    #[test]
    fn missing_txs_roundtrip() {
        let msg = MissingTxsNotification {
            block_hash: [9u8; 32],
            current_blockchain_height: 55,
            missing_txs: vec![[1u8; 32]],
        };
        let bytes = codec::to_binary(&msg).unwrap();
        let back: MissingTxsNotification = codec::from_binary(&bytes).unwrap();
        assert_eq!(back.block_hash, [9u8; 32]);
        assert_eq!(back.missing_txs.len(), 1);
    }

    #[test]
    fn ping_response_roundtrip() {
        let msg = PingResponse {
            status: PING_OK_RESPONSE_STATUS,
            peer_id: 7,
        };
        let bytes = codec::to_binary(&msg).unwrap();
        let back: PingResponse = codec::from_binary(&bytes).unwrap();
        assert_eq!(back.status, PING_OK_RESPONSE_STATUS);
        assert_eq!(back.peer_id, 7);
    }
}
