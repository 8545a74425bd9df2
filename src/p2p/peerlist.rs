//! Peer list management.
//!
//! Three containers per node: *white* for peers we have completed a
//! verified handshake with, *gray* for peers learned second-hand, and
//! *anchor* for recent outbound peers kept for reconnection stability.
//! Lists are ordered most-recently-seen first; random selection uses a
//! cubic-parabola index distribution favoring the front.

use std::net::SocketAddr;

use crate::constants;
use crate::p2p::messages::{P2pStateRecord, PeerlistEntry, P2P_STATE_VERSION};
use crate::p2p::PeerId;

/// An anchor entry: a peer we dialed successfully, with first-seen time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnchorPeerlistEntry {
    pub address: SocketAddr,
    pub id: PeerId,
    pub first_seen: u64,
}

/// White, gray and anchor peer lists.
#[derive(Default)]
pub struct PeerlistManager {
    white: Vec<PeerlistEntry>,
    gray: Vec<PeerlistEntry>,
    anchor: Vec<AnchorPeerlistEntry>,
}

/// Index with probability density `(max - i)² / max²`: picks the front of
/// a recency-ordered list far more often than the tail.
pub fn random_index_with_fixed_probability(max_index: usize) -> usize {
    if max_index == 0 {
        return 0;
    }
    let x = rand::random::<u64>() as u128 % (max_index as u128 + 1);
    ((x * x * x) / (max_index as u128 * max_index as u128)) as usize
}

impl PeerlistManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn white_peers_count(&self) -> usize {
        self.white.len()
    }

    pub fn gray_peers_count(&self) -> usize {
        self.gray.len()
    }

    pub fn get_white_peer_by_index(&self, index: usize) -> Option<PeerlistEntry> {
        self.white.get(index).copied()
    }

    pub fn get_gray_peer_by_index(&self, index: usize) -> Option<PeerlistEntry> {
        self.gray.get(index).copied()
    }

    pub fn anchor_peers(&self) -> Vec<AnchorPeerlistEntry> {
        self.anchor.clone()
    }

    /// Promote a peer to the white list (verified handshake). Removes any
    /// gray entry for the same address.
    pub fn append_with_peer_white(&mut self, entry: PeerlistEntry) {
        self.gray.retain(|p| p.address != entry.address);
        self.white.retain(|p| p.address != entry.address);
        self.white.insert(0, entry);
        self.white
            .sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        self.white
            .truncate(constants::P2P_LOCAL_WHITE_PEERLIST_LIMIT);
    }

    /// Record an unverified peer in the gray list. White entries win.
    pub fn append_with_peer_gray(&mut self, entry: PeerlistEntry) {
        if self.white.iter().any(|p| p.address == entry.address) {
            return;
        }
        self.gray.retain(|p| p.address != entry.address);
        self.gray.insert(0, entry);
        self.gray.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        self.gray
            .truncate(constants::P2P_LOCAL_GRAY_PEERLIST_LIMIT);
    }

    /// Record an outbound connection for post-restart reconnection.
    pub fn append_with_peer_anchor(&mut self, entry: AnchorPeerlistEntry) {
        self.anchor.retain(|p| p.address != entry.address);
        self.anchor.insert(0, entry);
        self.anchor
            .truncate(constants::P2P_ANCHOR_CONNECTIONS_COUNT);
    }

    pub fn remove_from_anchor(&mut self, address: SocketAddr) {
        self.anchor.retain(|p| p.address != address);
    }

    /// Demote a misbehaving white peer back to gray.
    pub fn demote_to_gray(&mut self, address: SocketAddr) {
        if let Some(pos) = self.white.iter().position(|p| p.address == address) {
            let entry = self.white.remove(pos);
            self.append_with_peer_gray(entry);
        }
    }

    /// Merge a peer list received from a remote, capping what we accept.
    pub fn merge_peerlist(&mut self, entries: &[PeerlistEntry]) {
        for entry in entries.iter().take(constants::P2P_PEERS_IN_HANDSHAKE) {
            self.append_with_peer_gray(*entry);
        }
    }

    /// Update the last-seen time of a known peer.
    pub fn set_peer_just_seen(&mut self, id: PeerId, address: SocketAddr, now: u64) {
        self.append_with_peer_white(PeerlistEntry {
            address,
            id,
            last_seen: now,
        });
    }

    /// The freshest white peers, for sharing in handshake responses.
    pub fn get_peerlist_head(&self, max_count: usize) -> Vec<PeerlistEntry> {
        self.white.iter().take(max_count).copied().collect()
    }

    pub fn serialize_state(&self, peer_id: PeerId) -> P2pStateRecord {
        P2pStateRecord {
            version: P2P_STATE_VERSION,
            peer_id,
            white: self.white.clone(),
            gray: self.gray.clone(),
            anchor: self
                .anchor
                .iter()
                .map(|a| (a.address, a.id, a.first_seen))
                .collect(),
        }
    }

    pub fn restore_state(&mut self, record: P2pStateRecord) {
        self.white = record.white;
        self.white
            .truncate(constants::P2P_LOCAL_WHITE_PEERLIST_LIMIT);
        self.gray = record.gray;
        self.gray
            .truncate(constants::P2P_LOCAL_GRAY_PEERLIST_LIMIT);
        self.anchor = record
            .anchor
            .into_iter()
            .map(|(address, id, first_seen)| AnchorPeerlistEntry {
                address,
                id,
                first_seen,
            })
            .collect();
        self.anchor
            .truncate(constants::P2P_ANCHOR_CONNECTIONS_COUNT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, last_seen: u64) -> PeerlistEntry {
        PeerlistEntry {
            address: format!("10.0.0.{}:{}", port % 250 + 1, port).parse().unwrap(),
            id: port as u64,
            last_seen,
        }
    }

    #[test]
    fn white_promotion_removes_gray() {
        let mut peers = PeerlistManager::new();
        let e = entry(1000, 5);
        peers.append_with_peer_gray(e);
        assert_eq!(peers.gray_peers_count(), 1);
        peers.append_with_peer_white(e);
        assert_eq!(peers.gray_peers_count(), 0);
        assert_eq!(peers.white_peers_count(), 1);
        // Gray re-add of a white peer is refused.
        peers.append_with_peer_gray(e);
        assert_eq!(peers.gray_peers_count(), 0);
    }

    #[test]
    fn no_duplicate_addresses() {
        let mut peers = PeerlistManager::new();
        peers.append_with_peer_white(entry(1000, 5));
        peers.append_with_peer_white(entry(1000, 9));
        assert_eq!(peers.white_peers_count(), 1);
        assert_eq!(peers.get_white_peer_by_index(0).unwrap().last_seen, 9);
    }

    #[test]
    fn ordering_is_most_recent_first() {
        let mut peers = PeerlistManager::new();
        peers.append_with_peer_white(entry(1000, 5));
        peers.append_with_peer_white(entry(1001, 50));
        peers.append_with_peer_white(entry(1002, 20));
        let head = peers.get_peerlist_head(10);
        let seen: Vec<u64> = head.iter().map(|p| p.last_seen).collect();
        assert_eq!(seen, vec![50, 20, 5]);
    }

    #[test]
    fn white_list_capped() {
        let mut peers = PeerlistManager::new();
        for i in 0..(constants::P2P_LOCAL_WHITE_PEERLIST_LIMIT + 50) {
            peers.append_with_peer_white(PeerlistEntry {
                address: format!("10.{}.{}.1:16000", i / 250, i % 250).parse().unwrap(),
                id: i as u64,
                last_seen: i as u64,
            });
        }
        assert_eq!(
            peers.white_peers_count(),
            constants::P2P_LOCAL_WHITE_PEERLIST_LIMIT
        );
        // The oldest entries were dropped.
        assert!(peers.get_peerlist_head(1)[0].last_seen >= 50);
    }

    #[test]
    fn anchor_capped_at_two() {
        let mut peers = PeerlistManager::new();
        for i in 0..5u16 {
            peers.append_with_peer_anchor(AnchorPeerlistEntry {
                address: format!("10.0.1.{}:16000", i + 1).parse().unwrap(),
                id: i as u64,
                first_seen: i as u64,
            });
        }
        assert_eq!(peers.anchor_peers().len(), constants::P2P_ANCHOR_CONNECTIONS_COUNT);
    }

    #[test]
    fn parabola_favors_front() {
        let mut front = 0usize;
        let samples = 10_000;
        for _ in 0..samples {
            if random_index_with_fixed_probability(99) < 25 {
                front += 1;
            }
        }
        // The first quarter of indexes should absorb well over half of the
        // picks under the cubic density.
        assert!(front > samples / 2, "front hits: {front}");
        assert_eq!(random_index_with_fixed_probability(0), 0);
    }

    #[test]
    fn demote_moves_white_to_gray() {
        let mut peers = PeerlistManager::new();
        let e = entry(1000, 5);
        peers.append_with_peer_white(e);
        peers.demote_to_gray(e.address);
        assert_eq!(peers.white_peers_count(), 0);
        assert_eq!(peers.gray_peers_count(), 1);
    }

    #[test]
    fn state_roundtrip() {
        let mut peers = PeerlistManager::new();
        peers.append_with_peer_white(entry(1000, 5));
        peers.append_with_peer_gray(entry(1001, 6));
        peers.append_with_peer_anchor(AnchorPeerlistEntry {
            address: "10.0.0.9:16000".parse().unwrap(),
            id: 9,
            first_seen: 1,
        });
        let record = peers.serialize_state(777);
        assert_eq!(record.peer_id, 777);

        let mut restored = PeerlistManager::new();
        restored.restore_state(record);
        assert_eq!(restored.white_peers_count(), 1);
        assert_eq!(restored.gray_peers_count(), 1);
        assert_eq!(restored.anchor_peers().len(), 1);
    }
}
