// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster membership: the set of known peers and the current leader.

use std::collections::HashMap;

use crate::wire::{PeerId, PeerInfo};

/// In-memory registry of known peers, always containing self.
pub struct Membership {
    self_id: PeerId,
    peers: HashMap<PeerId, PeerInfo>,
    leader_id: Option<PeerId>,
}

impl Membership {
    pub fn new(self_info: PeerInfo) -> Self {
        let mut peers = HashMap::new();
        peers.insert(self_info.peer_id, self_info);
        Self {
            self_id: self_info.peer_id,
            peers,
            leader_id: None,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn add(&mut self, peer: PeerInfo) {
        self.peers.insert(peer.peer_id, peer);
    }

    /// Remove a peer; self is never removed.
    pub fn remove(&mut self, peer_id: PeerId) {
        if peer_id != self.self_id {
            self.peers.remove(&peer_id);
            if self.leader_id == Some(peer_id) {
                self.leader_id = None;
            }
        }
    }

    pub fn get(&self, peer_id: PeerId) -> Option<PeerInfo> {
        self.peers.get(&peer_id).copied()
    }

    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.peers.values().copied().collect()
    }

    pub fn others(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .copied()
            .filter(|p| p.peer_id != self.self_id)
            .collect()
    }

    /// Peers with an id greater than self, i.e. higher Bully priority.
    pub fn higher_priority_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .copied()
            .filter(|p| p.peer_id > self.self_id)
            .collect()
    }

    pub fn set_leader(&mut self, leader_id: PeerId) {
        self.leader_id = Some(leader_id);
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_id
    }

    pub fn leader(&self) -> Option<PeerInfo> {
        self.leader_id.and_then(|id| self.get(id))
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id == Some(self.self_id)
    }

    /// Merge a received membership snapshot; never removes entries.
    pub fn update_from_list(&mut self, list: &[PeerInfo]) {
        for peer in list {
            if peer.peer_id != self.self_id {
                self.add(*peer);
            }
        }
    }
}
