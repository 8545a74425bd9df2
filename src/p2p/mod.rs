//! Peer-to-peer networking: Levin-framed transport, command payloads,
//! white/gray/anchor peer lists and the node event loop.

pub mod levin;
pub mod messages;
pub mod node;
pub mod peerlist;

/// Random 64-bit identity a node presents in handshakes.
pub type PeerId = u64;

/// Identifier of one live connection within the node loop.
pub type ConnectionId = u64;

/// Network identity: nodes on different networks refuse to handshake.
pub const NETWORK_ID: [u8; 16] = [
    0x50, 0x45, 0x52, 0x49, 0x44, 0x4f, 0x54, 0x2d, 0x4e, 0x45, 0x54, 0x2d, 0x4d, 0x41, 0x49,
    0x4e,
];
