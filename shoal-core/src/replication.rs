//! Per-chunk replication bookkeeping: desired degree vs. the set of peers seen holding it.

use dashmap::DashSet;

use crate::identity::NodeId;

/// One chunk's replication record. Shared between handler tasks; the peer set is
/// concurrent so STORED/REMOVED from different peers never need a common lock.
#[derive(Debug)]
pub struct ChunkRecord {
    pub chunk_no: u32,
    pub desired: u32,
    pub size: u64,
    peers: DashSet<NodeId>,
}

/// Outcome of applying a REMOVED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Sender was not in the peer set; nothing changed.
    Unchanged,
    /// Sender removed; degree still meets the target.
    Satisfied,
    /// Sender removed and the chunk fell below its desired degree.
    UnderReplicated,
}

impl ChunkRecord {
    pub fn new(chunk_no: u32, desired: u32, size: u64) -> Self {
        Self {
            chunk_no,
            desired,
            size,
            peers: DashSet::new(),
        }
    }

    pub fn with_peers(
        chunk_no: u32,
        desired: u32,
        size: u64,
        peers: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let record = Self::new(chunk_no, desired, size);
        for peer in peers {
            record.peers.insert(peer);
        }
        record
    }

    /// Observed degree: number of distinct peers known to hold a copy.
    pub fn observed(&self) -> u32 {
        self.peers.len() as u32
    }

    /// Degree counting this node's own copy when it holds one.
    pub fn effective(&self, held_locally: bool) -> u32 {
        self.observed() + u32::from(held_locally)
    }

    pub fn is_satisfied(&self, held_locally: bool) -> bool {
        self.effective(held_locally) >= self.desired
    }

    /// observed - desired. Negative when under-replicated.
    pub fn slack(&self) -> i64 {
        i64::from(self.observed()) - i64::from(self.desired)
    }

    /// Sorted snapshot of the peer set.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self.peers.iter().map(|p| *p).collect();
        out.sort();
        out
    }

    /// Apply a STORED from `peer`. Returns true if the peer was new.
    pub fn record_stored(&self, peer: NodeId) -> bool {
        self.peers.insert(peer)
    }

    /// Apply a REMOVED from `peer`.
    pub fn record_removed(&self, peer: NodeId, held_locally: bool) -> Removal {
        if self.peers.remove(&peer).is_none() {
            return Removal::Unchanged;
        }
        if self.is_satisfied(held_locally) {
            Removal::Satisfied
        } else {
            Removal::UnderReplicated
        }
    }
}
