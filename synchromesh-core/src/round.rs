//! Round driver: persistent node state, per-round scratch and the round
//! entry points.
//!
//! [`MergeCommit`] owns everything that survives across rounds and is the
//! only place persistent state is mutated; the application reads it between
//! rounds. Per-round scratch is reset by [`MergeCommit::begin_round`] and
//! published by [`MergeCommit::finish_round`].

use alloc::vec::Vec;

use bitflags::bitflags;
use synchromesh_hal::{Flooding, RadioError, RandomSource, RoundParams};

use crate::bitmap;
use crate::config::{ConfigError, RoundConfig, FLAGS_LEN, MAX_NODE_COUNT};
use crate::join::NodeTable;
use crate::stats::SlotStats;
use crate::value::MergeValue;
use crate::wire::{Election, Packet, Payload, Phase, RoundType};
use crate::{NodeId, NodeIndex};

bitflags! {
    /// Outcome summary of one round.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OutcomeFlags: u8 {
        /// Every join-mask bit was witnessed in the commit phase.
        const COMPLETE = 1 << 0;
        /// This node obtained an index during the round.
        const JOINED = 1 << 1;
        /// This node gave up its index during the round.
        const LEFT = 1 << 2;
        /// At least one transmission was made.
        const DID_TX = 1 << 3;
    }
}

/// Desired membership for upcoming rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantedJoinState {
    Leave,
    Join,
}

/// Why a node was forced back onto the joining path; kept for
/// observability, the wire has no room for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejoinReason {
    pub local_config: u16,
    pub observed_config: u16,
}

/// Identity and membership surviving across rounds.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node_id: NodeId,
    pub has_node_index: bool,
    pub node_index: NodeIndex,
    pub is_initiator: bool,
    pub node_count: u8,
    /// Member id per index; maintained by (former) initiators and adopted
    /// wholesale by an election winner.
    pub joined_nodes: [NodeId; MAX_NODE_COUNT],
    pub table: NodeTable,
    /// Set by a forced rejoin; the node re-requests its index next round
    /// even when it would rather leave.
    pub rejoin_needed: bool,
    pub last_rejoin_reason: Option<RejoinReason>,
}

impl NodeState {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            has_node_index: false,
            node_index: 0,
            is_initiator: false,
            node_count: 0,
            joined_nodes: [0; MAX_NODE_COUNT],
            table: NodeTable::new(),
            rejoin_needed: false,
            last_rejoin_reason: None,
        }
    }
}

/// Everything reset at round start.
pub(crate) struct RoundScratch<V> {
    pub(crate) tx: Packet<V>,
    pub(crate) complete: bool,
    pub(crate) completion_slot: u16,
    pub(crate) tx_count_complete: u16,
    pub(crate) invalid_rx_count: u16,
    pub(crate) got_valid_rx: bool,
    pub(crate) did_tx: bool,
    pub(crate) restart_threshold: u16,
    pub(crate) off_slot: u16,
    pub(crate) rx_progress: bool,
    pub(crate) join_masks: [u8; FLAGS_LEN],
    pub(crate) has_initial_join_masks: bool,
    pub(crate) delta_at_slot: u16,
    pub(crate) was_initiator: bool,
    pub(crate) joined: bool,
    pub(crate) left: bool,
    pub(crate) ended: bool,
    pub(crate) final_phase: Phase,
    pub(crate) final_type: RoundType,
    pub(crate) final_value: V,
    pub(crate) final_flags: [u8; 2 * FLAGS_LEN],
    pub(crate) stats: Vec<SlotStats>,
}

impl<V: MergeValue> RoundScratch<V> {
    fn new(max_slots: u16) -> Self {
        Self {
            tx: Packet::default(),
            complete: false,
            completion_slot: 0,
            tx_count_complete: 0,
            invalid_rx_count: 0,
            got_valid_rx: false,
            did_tx: false,
            restart_threshold: 0,
            off_slot: max_slots,
            rx_progress: false,
            join_masks: [0; FLAGS_LEN],
            has_initial_join_masks: false,
            delta_at_slot: 0,
            was_initiator: false,
            joined: false,
            left: false,
            ended: false,
            final_phase: Phase::Merge,
            final_type: RoundType::Unknown,
            final_value: V::default(),
            final_flags: [0; 2 * FLAGS_LEN],
            stats: Vec::new(),
        }
    }
}

/// Result of one round as seen by the application.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub phase: Phase,
    pub round_type: RoundType,
    /// First slot at which completeness was witnessed; 0 when the round
    /// never reached a witnessed commit.
    pub completion_slot: u16,
    /// Slot at which this node finished.
    pub off_slot: u16,
    pub outcome: OutcomeFlags,
    /// Final participation flags followed by the leave bits.
    pub final_flags: [u8; 2 * FLAGS_LEN],
}

/// One node's merge-commit protocol instance.
pub struct MergeCommit<V: MergeValue, R: RandomSource> {
    pub(crate) state: NodeState,
    pub(crate) config: RoundConfig,
    pub(crate) rng: R,
    /// Desired membership for the coming rounds.
    pub wanted_join_state: WantedJoinState,
    /// Round type an initiator starts next; coerced to coordination when
    /// unset.
    pub wanted_type: RoundType,
    /// Priority advertised in handover elections.
    pub wanted_election_priority: u16,
    pub(crate) scratch: RoundScratch<V>,
}

impl<V: MergeValue, R: RandomSource> MergeCommit<V, R> {
    pub fn new(node_id: NodeId, config: RoundConfig, rng: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: NodeState::new(node_id),
            config,
            rng,
            wanted_join_state: WantedJoinState::Join,
            wanted_type: RoundType::Unknown,
            wanted_election_priority: 0,
            scratch: RoundScratch::new(config.max_slots),
        })
    }

    /// Seed a fresh one-node network with this node as initiator, index 0.
    pub fn bootstrap_as_initiator(&mut self) {
        let st = &mut self.state;
        st.is_initiator = true;
        st.has_node_index = true;
        st.node_index = 0;
        st.joined_nodes = [0; MAX_NODE_COUNT];
        st.joined_nodes[0] = st.node_id;
        st.node_count = 1;
        st.table.rebuild(&st.joined_nodes);
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Direct state access for host bootstrap and test rigs.
    pub fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// One agreement round per flood; there is always work to do.
    pub fn is_pending(&self, _round_number: u16) -> bool {
        true
    }

    pub fn has_joined(&self) -> bool {
        self.scratch.joined
    }

    pub fn has_left(&self) -> bool {
        self.scratch.left
    }

    pub fn did_tx(&self) -> bool {
        self.scratch.did_tx
    }

    pub fn off_slot(&self) -> u16 {
        self.scratch.off_slot
    }

    pub fn completion_slot(&self) -> u16 {
        self.scratch.completion_slot
    }

    /// Snapshots recorded during the last round, one per processed slot.
    pub fn slot_stats(&self) -> &[SlotStats] {
        &self.scratch.stats
    }

    /// Run one full round through a flooding layer and report the outcome.
    /// On a committed round the agreed value replaces `value`.
    pub fn round_begin<F: Flooding>(
        &mut self,
        round_number: u16,
        app_id: u8,
        value: &mut V,
        flooding: &mut F,
    ) -> Result<RoundReport, RadioError> {
        let seed = self.begin_round(round_number, value);
        let params = RoundParams {
            round_number,
            app_id,
            payload_len: seed.len(),
            slot_len_dco: self.config.slot_len_dco,
            max_slots: self.config.max_slots,
            flags_len: FLAGS_LEN,
        };
        flooding.round(&params, &seed, self)?;
        Ok(self.finish_round(value))
    }

    /// Reset per-round state and build the seed packet. Hosts normally go
    /// through [`Self::round_begin`]; the split entry points exist for
    /// simulators and custom flood drivers that interleave many nodes.
    pub fn begin_round(&mut self, _round_number: u16, value: &V) -> Vec<u8> {
        let threshold = self
            .rng
            .rand_range(self.config.restart_min as u32, self.config.restart_max as u32)
            as u16;
        if !matches!(
            self.wanted_type,
            RoundType::Coordination | RoundType::ElectionAndHandover
        ) {
            self.wanted_type = RoundType::Coordination;
        }
        self.scratch = RoundScratch::new(self.config.max_slots);

        let s = &mut self.scratch;
        let st = &mut self.state;
        s.restart_threshold = threshold;
        s.was_initiator = st.is_initiator;
        s.tx.phase = Phase::Merge;

        if st.is_initiator {
            st.rejoin_needed = false;
            if self.wanted_join_state == WantedJoinState::Leave {
                if st.node_count > 1 {
                    // hand the network over before going
                    s.tx.round_type = RoundType::ElectionAndHandover;
                } else {
                    // a lone initiator simply leaves
                    st.is_initiator = false;
                    s.tx.round_type = RoundType::Unknown;
                    st.has_node_index = false;
                    s.left = true;
                    st.node_count = 0;
                }
            } else {
                s.tx.round_type = self.wanted_type;
            }
        } else {
            s.tx.round_type = RoundType::Unknown;
        }

        if st.has_node_index
            && matches!(s.tx.round_type, RoundType::Unknown | RoundType::Coordination)
        {
            s.tx.payload = Payload::Value(value.clone());
        } else if s.tx.round_type == RoundType::ElectionAndHandover {
            let members = if st.is_initiator { Some(&st.joined_nodes) } else { None };
            s.tx.payload = Payload::Election(Election::seed(
                st.node_id,
                self.wanted_election_priority,
                members,
            ));
        }

        if st.has_node_index {
            s.tx.join.node_count = st.node_count;
            bitmap::set_bit(&mut s.tx.flags, st.node_index as usize);
            // only a member vouches for its configuration
            s.tx.join.config = st.table.config();
        }

        if st.is_initiator {
            for (i, &id) in st.joined_nodes.iter().enumerate() {
                if id != 0 {
                    bitmap::set_bit(&mut s.join_masks, i);
                }
            }
            s.has_initial_join_masks = true;
            // every uninhabited index starts out as already gone
            for i in 0..FLAGS_LEN {
                s.tx.leaves[i] = !s.join_masks[i];
            }
        }

        if st.has_node_index && self.wanted_join_state == WantedJoinState::Leave {
            bitmap::set_bit(&mut s.tx.leaves, st.node_index as usize);
        } else if !st.is_initiator
            && !st.has_node_index
            && (st.rejoin_needed || self.wanted_join_state == WantedJoinState::Join)
        {
            s.tx.join.slots[0] = st.node_id;
            s.tx.join.slot_count = 1;
        }

        s.final_phase = s.tx.phase;
        s.final_type = s.tx.round_type;
        s.final_value = match &s.tx.payload {
            Payload::Value(v) => v.clone(),
            Payload::Election(_) => V::default(),
        };
        s.tx.to_vec()
    }

    /// Publish the round outcome. A round that never reached COMMIT hands
    /// the caller `completion_slot == 0` and the merged-so-far value.
    pub fn finish_round(&mut self, value: &mut V) -> RoundReport {
        let s = &self.scratch;
        *value = s.final_value.clone();
        let mut outcome = OutcomeFlags::empty();
        if s.complete {
            outcome |= OutcomeFlags::COMPLETE;
        }
        if s.joined {
            outcome |= OutcomeFlags::JOINED;
        }
        if s.left {
            outcome |= OutcomeFlags::LEFT;
        }
        if s.did_tx {
            outcome |= OutcomeFlags::DID_TX;
        }
        RoundReport {
            phase: s.final_phase,
            round_type: s.final_type,
            completion_slot: s.completion_slot,
            off_slot: s.off_slot,
            outcome,
            final_flags: s.final_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Max32;
    use synchromesh_hal::SoftRng;

    fn node(id: NodeId) -> MergeCommit<Max32, SoftRng> {
        MergeCommit::new(id, RoundConfig::default(), SoftRng::new(id as u32)).unwrap()
    }

    #[test]
    fn initiator_seed_packet_carries_flag_and_value() {
        let mut mc = node(1);
        mc.bootstrap_as_initiator();
        let seed = mc.begin_round(1, &Max32(42));
        let pkt = Packet::<Max32>::decode(&seed).unwrap();
        assert_eq!(pkt.phase, Phase::Merge);
        assert_eq!(pkt.round_type, RoundType::Coordination);
        assert_eq!(pkt.value(), Some(&Max32(42)));
        assert!(bitmap::test_bit(&pkt.flags, 0));
        // every slot but the initiator's is marked gone
        assert!(!bitmap::test_bit(&pkt.leaves, 0));
        assert!(bitmap::test_bit(&pkt.leaves, 1));
    }

    #[test]
    fn joiner_seed_packet_requests_a_slot() {
        let mut mc = node(9);
        let seed = mc.begin_round(1, &Max32(0));
        let pkt = Packet::<Max32>::decode(&seed).unwrap();
        assert_eq!(pkt.round_type, RoundType::Unknown);
        assert_eq!(pkt.join.slot_count, 1);
        assert_eq!(pkt.join.slots[0], 9);
        assert_eq!(pkt.flags, [0; FLAGS_LEN]);
    }

    #[test]
    fn lone_initiator_leave_needs_no_election() {
        let mut mc = node(1);
        mc.bootstrap_as_initiator();
        mc.wanted_join_state = WantedJoinState::Leave;
        let mut value = Max32(0);
        let seed = mc.begin_round(1, &value);
        let pkt = Packet::<Max32>::decode(&seed).unwrap();
        assert_eq!(pkt.round_type, RoundType::Unknown);
        let report = mc.finish_round(&mut value);
        assert!(report.outcome.contains(OutcomeFlags::LEFT));
        assert!(!mc.state().is_initiator);
        assert!(!mc.state().has_node_index);
        assert_eq!(mc.state().node_count, 0);
    }

    #[test]
    fn leaving_initiator_with_peers_starts_an_election() {
        let mut mc = node(1);
        mc.bootstrap_as_initiator();
        let st = mc.state_mut();
        st.joined_nodes[1] = 2;
        st.node_count = 2;
        st.table.rebuild(&st.joined_nodes.clone());
        mc.wanted_join_state = WantedJoinState::Leave;
        let seed = mc.begin_round(1, &Max32(0));
        let pkt = Packet::<Max32>::decode(&seed).unwrap();
        assert_eq!(pkt.round_type, RoundType::ElectionAndHandover);
        let election = pkt.election().unwrap();
        assert_eq!(election.leader_node_id, 1);
        assert_eq!(election.joined_nodes[1], 2);
        // the leaving initiator flags its own departure
        assert!(bitmap::test_bit(&pkt.leaves, 0));
    }
}
