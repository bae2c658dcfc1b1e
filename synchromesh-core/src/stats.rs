//! Per-slot progress snapshots for offline analysis.
//!
//! One snapshot is recorded for every slot a node processes; the whole
//! round can be serialized with postcard and shipped off the node between
//! rounds.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

/// Progress of one node at one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub node_count: u8,
    /// Number of participation bits collected so far.
    pub flag_progress: u8,
    pub phase: u8,
    pub has_node_index: bool,
    pub node_index: u8,
    pub round_type: u8,
    pub is_initiator: bool,
    pub config: u16,
}

/// Serialize a round of snapshots for export.
pub fn export(stats: &[SlotStats]) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(stats)
}

/// Parse an exported round back into snapshots.
pub fn import(bytes: &[u8]) -> Result<Vec<SlotStats>, postcard::Error> {
    postcard::from_bytes(bytes)
}
