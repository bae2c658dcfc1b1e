//! Leader election merge rules for initiator handover rounds.

use crate::config::MAX_NODE_COUNT;
use crate::wire::Election;

/// Fold a received election payload into ours; true when the packets
/// disagreed and a retransmission is warranted.
///
/// Higher priority wins; on a priority tie the higher node id wins, so a
/// zeroed (unseeded) payload can never elect node id 0.
pub fn merge(tx: &mut Election, rx: &Election) -> bool {
    let mut tx_needed = false;

    if tx.priority != rx.priority {
        tx_needed = true;
        if tx.priority < rx.priority {
            tx.priority = rx.priority;
            tx.leader_node_id = rx.leader_node_id;
        }
    } else if tx.leader_node_id < rx.leader_node_id {
        tx_needed = true;
        tx.leader_node_id = rx.leader_node_id;
    }

    for i in 0..MAX_NODE_COUNT {
        tx_needed |= tx.joined_nodes[i] != rx.joined_nodes[i];
        // member entries spread by adopting whatever is non-zero
        if tx.joined_nodes[i] == 0 {
            tx.joined_nodes[i] = rx.joined_nodes[i];
        }
    }

    tx_needed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_wins() {
        let mut tx = Election::seed(3, 2, None);
        let rx = Election::seed(7, 5, None);
        assert!(merge(&mut tx, &rx));
        assert_eq!(tx.leader_node_id, 7);
        assert_eq!(tx.priority, 5);

        // the winner keeps its state against a weaker packet
        let weaker = Election::seed(9, 1, None);
        merge(&mut tx, &weaker);
        assert_eq!(tx.leader_node_id, 7);
        assert_eq!(tx.priority, 5);
    }

    #[test]
    fn priority_tie_elects_the_higher_id() {
        let mut tx = Election::seed(3, 4, None);
        let rx = Election::seed(8, 4, None);
        assert!(merge(&mut tx, &rx));
        assert_eq!(tx.leader_node_id, 8);

        let mut higher = Election::seed(8, 4, None);
        assert!(merge(&mut higher, &Election::seed(3, 4, None)));
        assert_eq!(higher.leader_node_id, 8);
    }

    #[test]
    fn unseeded_payload_cannot_elect_node_zero() {
        let mut tx = Election::default();
        let rx = Election::seed(1, 0, None);
        merge(&mut tx, &rx);
        assert_eq!(tx.leader_node_id, 1);
    }

    #[test]
    fn member_entries_adopt_non_zero_values() {
        let mut members = [0; MAX_NODE_COUNT];
        members[0] = 1;
        members[2] = 3;
        let mut tx = Election::seed(5, 0, None);
        let rx = Election::seed(5, 0, Some(&members));
        assert!(merge(&mut tx, &rx));
        assert_eq!(tx.joined_nodes, members);
    }
}
