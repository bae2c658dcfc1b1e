//! Membership bookkeeping: the node table, free index slots and the
//! round-configuration sequence, plus the pre-commit merge of join
//! requests.

use heapless::Vec as FixedVec;

use crate::config::{JOIN_SLOTS, MAX_NODE_COUNT};
use crate::wire::JoinData;
use crate::{NodeId, NodeIndex};

/// Node-id to index bookkeeping kept by every (former) initiator. The
/// ordered map is rebuilt after each round so joins during the round stay
/// O(1) and lookups stay binary-search.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    /// (node id, index) pairs sorted by node id.
    map: FixedVec<(NodeId, NodeIndex), MAX_NODE_COUNT>,
    /// Unassigned indices, descending, so the lowest index is popped first.
    free: FixedVec<NodeIndex, MAX_NODE_COUNT>,
    config: u16,
}

impl NodeTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        table.rebuild(&[0; MAX_NODE_COUNT]);
        table
    }

    pub fn config(&self) -> u16 {
        self.config
    }

    pub fn set_config(&mut self, config: u16) {
        self.config = config;
    }

    /// Bump the sequence after a committed round.
    pub fn bump_config(&mut self) {
        self.config = self.config.wrapping_add(1);
    }

    /// Index previously assigned to `id`, if any.
    pub fn index_for(&self, id: NodeId) -> Option<NodeIndex> {
        self.map
            .binary_search_by_key(&id, |entry| entry.0)
            .ok()
            .map(|pos| self.map[pos].1)
    }

    /// Assign the lowest free index to `id` and record it in `joined`.
    /// A node that is already known keeps its old index; `None` means the
    /// network is full. `node_count` grows only on a fresh assignment.
    pub fn add_node(
        &mut self,
        id: NodeId,
        joined: &mut [NodeId; MAX_NODE_COUNT],
        node_count: &mut u8,
    ) -> Option<NodeIndex> {
        if id == 0 {
            return None;
        }
        if let Some(index) = self.index_for(id) {
            return Some(index);
        }
        let index = self.free.pop()?;
        joined[index as usize] = id;
        *node_count += 1;
        let pos = self
            .map
            .binary_search_by_key(&id, |entry| entry.0)
            .unwrap_err();
        // map capacity equals the index space, the insert cannot overflow
        let _ = self.map.insert(pos, (id, index));
        Some(index)
    }

    /// Rebuild the ordered map and the free-slot pool from the member
    /// array. Called between rounds by (former) initiators.
    pub fn rebuild(&mut self, joined: &[NodeId; MAX_NODE_COUNT]) {
        self.map.clear();
        for (index, &id) in joined.iter().enumerate() {
            if id != 0 {
                let _ = self.map.push((id, index as NodeIndex));
            }
        }
        self.map.sort_unstable_by_key(|entry| entry.0);
        self.free.clear();
        for index in (0..MAX_NODE_COUNT).rev() {
            if joined[index] == 0 {
                let _ = self.free.push(index as NodeIndex);
            }
        }
    }
}

/// Merge received join requests into the outgoing set.
///
/// Returns `(tx_needed, delta)`: `tx_needed` when the packets disagree and
/// retransmission helps convergence, `delta` when the outgoing set gained
/// new information (resets the initiator's quiescence clock).
pub fn merge_requests(tx: &mut JoinData, rx: &JoinData) -> (bool, bool) {
    let mut tx_needed = false;
    let mut delta = false;

    for i in 0..rx.slot_count.min(JOIN_SLOTS as u8) as usize {
        let id = rx.slots[i];
        if id == 0 || tx.slots[..tx.slot_count as usize].contains(&id) {
            continue;
        }
        if (tx.slot_count as usize) < JOIN_SLOTS {
            tx.slots[tx.slot_count as usize] = id;
            tx.slot_count += 1;
            tx_needed = true;
            delta = true;
        } else if !tx.overflow {
            // the request table is full; the requester retries next round
            tx.overflow = true;
            tx_needed = true;
            delta = true;
        }
    }

    if rx.overflow && !tx.overflow {
        tx.overflow = true;
        tx_needed = true;
        delta = true;
    }

    // a peer missing some of our requests needs to hear them again
    if rx.slot_count != tx.slot_count || rx.overflow != tx.overflow {
        tx_needed = true;
    }

    (tx_needed, delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(ids: &[NodeId]) -> (NodeTable, [NodeId; MAX_NODE_COUNT]) {
        let mut joined = [0; MAX_NODE_COUNT];
        for (i, &id) in ids.iter().enumerate() {
            joined[i] = id;
        }
        let mut table = NodeTable::new();
        table.rebuild(&joined);
        (table, joined)
    }

    #[test]
    fn add_node_assigns_lowest_free_index() {
        let (mut table, mut joined) = table_of(&[10, 20]);
        let mut count = 2;
        assert_eq!(table.add_node(30, &mut joined, &mut count), Some(2));
        assert_eq!(count, 3);
        assert_eq!(joined[2], 30);
        assert_eq!(table.index_for(30), Some(2));
    }

    #[test]
    fn add_node_is_idempotent_for_known_ids() {
        let (mut table, mut joined) = table_of(&[10, 20]);
        let mut count = 2;
        assert_eq!(table.add_node(20, &mut joined, &mut count), Some(1));
        assert_eq!(count, 2);
    }

    #[test]
    fn full_table_reports_overflow() {
        let ids: alloc::vec::Vec<NodeId> = (1..=MAX_NODE_COUNT as NodeId).collect();
        let (mut table, mut joined) = table_of(&ids);
        let mut count = MAX_NODE_COUNT as u8;
        assert_eq!(table.add_node(99, &mut joined, &mut count), None);
    }

    #[test]
    fn rebuild_after_leave_frees_the_index() {
        let (mut table, mut joined) = table_of(&[10, 20, 30]);
        joined[1] = 0;
        table.rebuild(&joined);
        assert_eq!(table.index_for(20), None);
        let mut count = 2;
        assert_eq!(table.add_node(40, &mut joined, &mut count), Some(1));
    }

    #[test]
    fn merge_requests_unions_and_dedups() {
        let mut tx = JoinData { slot_count: 1, slots: [5, 0, 0, 0], ..JoinData::default() };
        let rx = JoinData { slot_count: 2, slots: [5, 7, 0, 0], ..JoinData::default() };
        let (tx_needed, delta) = merge_requests(&mut tx, &rx);
        assert!(tx_needed);
        assert!(delta);
        assert_eq!(tx.slot_count, 2);
        assert_eq!(&tx.slots[..2], &[5, 7]);

        // merging the same packet again is a no-op
        let again = tx;
        let (tx_needed, delta) = merge_requests(&mut tx, &again);
        assert!(!tx_needed);
        assert!(!delta);
    }

    #[test]
    fn merge_requests_marks_overflow_when_full() {
        let mut tx = JoinData {
            slot_count: JOIN_SLOTS as u8,
            slots: [1, 2, 3, 4],
            ..JoinData::default()
        };
        let rx = JoinData { slot_count: 1, slots: [9, 0, 0, 0], ..JoinData::default() };
        let (tx_needed, delta) = merge_requests(&mut tx, &rx);
        assert!(tx_needed);
        assert!(delta);
        assert!(tx.overflow);
        assert_eq!(tx.slot_count, JOIN_SLOTS as u8);
    }
}
