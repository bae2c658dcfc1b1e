//! Two-phase commit engine: the per-slot state machine and the packet
//! handlers it dispatches to.
//!
//! The flooding layer calls [`MergeCommit::process_slot`] once per radio
//! slot. The scratch transmit packet is the only mutation surface while a
//! slot is handled; persistent state changes happen synchronously here or
//! in the round driver, never in between slots.

use synchromesh_hal::{ChaosState, RandomSource, SlotHandler};

use crate::bitmap;
use crate::config::{RoundConfig, FLAGS_LEN, JOIN_SLOTS, MAX_NODE_COUNT};
use crate::election;
use crate::join;
use crate::round::{MergeCommit, NodeState, RejoinReason, RoundScratch};
use crate::stats::SlotStats;
use crate::value::MergeValue;
use crate::wire::{Election, Packet, Payload, Phase, RoundType};

impl<V: MergeValue, R: RandomSource> SlotHandler for MergeCommit<V, R> {
    fn process_slot(
        &mut self,
        _round_number: u16,
        slot: u16,
        current: ChaosState,
        txrx_success: bool,
        rx_payload: &[u8],
        tx_payload: &mut [u8],
    ) -> ChaosState {
        let mut next = ChaosState::Rx;

        if self.state.is_initiator && current == ChaosState::Init {
            // seed the flood; counts as a valid reception so restarts work
            next = ChaosState::Tx;
            self.scratch.got_valid_rx = true;
        } else if current == ChaosState::Rx {
            let rx = if txrx_success {
                Packet::<V>::decode(rx_payload).ok()
            } else {
                None
            };
            if let Some(rx) = rx {
                self.scratch.got_valid_rx = true;
                let tx_needed = handle_received_packet(
                    &mut self.state,
                    &mut self.scratch,
                    &self.config,
                    self.wanted_election_priority,
                    slot,
                    &rx,
                );
                if tx_needed {
                    next = ChaosState::Tx;
                    if self.scratch.complete {
                        self.scratch.tx_count_complete += 1;
                    }
                }
            } else if self.scratch.got_valid_rx {
                self.scratch.invalid_rx_count += 1;
                if self.scratch.invalid_rx_count > self.scratch.restart_threshold {
                    // the flood stalled around us; transmit to restart it
                    next = ChaosState::Tx;
                    self.scratch.invalid_rx_count = 0;
                    if self.scratch.complete {
                        self.scratch.tx_count_complete += 1;
                    }
                    self.scratch.restart_threshold = self
                        .rng
                        .rand_range(self.config.restart_min as u32, self.config.restart_max as u32)
                        as u16;
                }
            }
        } else if current == ChaosState::Tx
            && (self.scratch.rx_progress || !self.config.reliable_ff)
            && self.scratch.tx_count_complete >= self.config.n_tx_complete
        {
            next = ChaosState::Off;
        }

        let mut end = slot >= self.config.max_slots - 1 || next == ChaosState::Off;

        if self.config.failures_rate > 0
            && !self.state.is_initiator
            && self.rng.rand_fast() < u32::MAX / self.config.failures_rate
        {
            next = ChaosState::Off;
            end = true;
        }

        if end && !self.scratch.ended {
            end_of_round(&mut self.state, &mut self.scratch, slot);
        }

        if next == ChaosState::Tx {
            self.scratch.did_tx = true;
            let _ = self.scratch.tx.encode_into(tx_payload);
        }

        record_stats(&self.state, &mut self.scratch);
        next
    }
}

/// Snapshot the final state and run the slot-boundary housekeeping.
fn end_of_round<V: MergeValue>(st: &mut NodeState, s: &mut RoundScratch<V>, slot: u16) {
    s.final_value = match s.tx.value() {
        Some(v) => v.clone(),
        None => V::default(),
    };
    s.final_phase = s.tx.phase;
    s.final_type = s.tx.round_type;
    s.final_flags[..FLAGS_LEN].copy_from_slice(&s.tx.flags);
    s.final_flags[FLAGS_LEN..].copy_from_slice(&s.tx.leaves);
    s.off_slot = slot;

    // a deposed initiator forgets its member list
    if !st.is_initiator && s.was_initiator {
        st.joined_nodes = [0; MAX_NODE_COUNT];
    }
    // keep the ordered map binary-searchable for the next round's joins
    if st.is_initiator || s.was_initiator {
        st.table.rebuild(&st.joined_nodes);
    }
    // bump the sequence only after the round settles so packet-relevance
    // checks stay uniform across round types
    if s.final_phase == Phase::Commit {
        st.table.bump_config();
    }
    s.ended = true;
}

fn record_stats<V: MergeValue>(st: &NodeState, s: &mut RoundScratch<V>) {
    s.stats.push(SlotStats {
        node_count: st.node_count,
        flag_progress: bitmap::popcount(&s.tx.flags) as u8,
        phase: s.tx.phase as u8,
        has_node_index: st.has_node_index,
        node_index: st.node_index,
        round_type: s.tx.round_type as u8,
        is_initiator: st.is_initiator,
        config: st.table.config(),
    });
}

/// Config arbitration and round-type dispatch for one received packet.
/// Returns whether a transmission is warranted.
fn handle_received_packet<V: MergeValue>(
    st: &mut NodeState,
    s: &mut RoundScratch<V>,
    cfg: &RoundConfig,
    wanted_priority: u16,
    slot: u16,
    rx: &Packet<V>,
) -> bool {
    // a node outside any network reuses the first observed configuration,
    // so it cannot wreck a newly formed network with a lower sequence
    if !st.has_node_index && s.tx.round_type == RoundType::Unknown {
        st.table.set_config(rx.join.config);
        s.tx.join.config = rx.join.config;
    }

    let local = st.table.config();
    if local < rx.join.config {
        crate::log!("mc: config {} behind {}, forced rejoin", local, rx.join.config);
        force_rejoin(st, s);
        st.last_rejoin_reason = Some(RejoinReason {
            local_config: local,
            observed_config: rx.join.config,
        });
        st.table.set_config(rx.join.config);
        // our whole packet may be stale; adopt the received one
        s.tx = rx.clone();
        return true;
    }
    if local > rx.join.config {
        // outdated packet; retransmit so the peer catches up
        return true;
    }

    match (s.tx.round_type, rx.round_type) {
        (RoundType::ElectionAndHandover, RoundType::Coordination) => {
            if !s.was_initiator && st.is_initiator {
                // freshly elected: the election round finishes on our terms
                true
            } else {
                // everyone else follows the live coordination state
                s.tx = rx.clone();
                true
            }
        }
        (RoundType::Coordination, RoundType::ElectionAndHandover) => {
            // stale election packet at the same config; educate the peer
            true
        }
        _ => {
            if rx.round_type == RoundType::ElectionAndHandover {
                handle_election_round(st, s, wanted_priority, slot, rx)
            } else {
                handle_coordination_round(st, s, cfg, slot, rx)
            }
        }
    }
}

/// Reset identity for this round and fall back to forwarding; the node
/// re-requests its old index next round.
fn force_rejoin<V: MergeValue>(st: &mut NodeState, s: &mut RoundScratch<V>) {
    if st.has_node_index {
        // a commit was missed; whoever committed owns the network now
        if st.is_initiator {
            st.is_initiator = false;
        }
        bitmap::clear_bit(&mut s.tx.flags, st.node_index as usize);
        bitmap::clear_bit(&mut s.tx.leaves, st.node_index as usize);
        st.has_node_index = false;
        st.node_index = 0;
        st.rejoin_needed = true;
    }
    // stale masks must not gate completeness against the adopted state
    s.has_initial_join_masks = false;
}

/// OR-merge flags and leaves; returns `(tx_needed, flags_complete,
/// rx_complete)`.
fn merge_flags<V: MergeValue>(s: &mut RoundScratch<V>, rx: &Packet<V>) -> (bool, bool, bool) {
    if !s.has_initial_join_masks {
        // the first valid packet reveals which indices actually exist
        for i in 0..FLAGS_LEN {
            s.join_masks[i] = !rx.leaves[i] | s.tx.flags[i] | rx.flags[i];
        }
        s.has_initial_join_masks = true;
    }

    let mut tx_needed = false;
    for i in 0..FLAGS_LEN {
        tx_needed |= s.tx.leaves[i] != rx.leaves[i] || s.tx.flags[i] != rx.flags[i];
        s.tx.leaves[i] |= rx.leaves[i];
        s.tx.flags[i] |= rx.flags[i];
    }
    let flags_complete = bitmap::covers(&s.tx.flags, &s.join_masks);
    let rx_complete = bitmap::covers(&rx.flags, &s.join_masks);
    (tx_needed, flags_complete, rx_complete)
}

/// Spread the single-slot rejoin channel and take it when it names us.
fn handle_rejoin<V: MergeValue>(
    st: &mut NodeState,
    s: &mut RoundScratch<V>,
    rx: &Packet<V>,
) -> bool {
    let mut tx_needed = false;
    if s.tx.rejoin_slot != rx.rejoin_slot {
        tx_needed = true;
        // first writer wins; ties between racing initiators settle through
        // the config sequence at the next round boundary
        if s.tx.rejoin_slot == 0 {
            s.tx.rejoin_slot = rx.rejoin_slot;
            s.tx.rejoin_index = rx.rejoin_index;
        }
    }
    if !st.has_node_index && s.tx.rejoin_slot == st.node_id {
        st.node_index = s.tx.rejoin_index;
        st.has_node_index = true;
        s.joined = true;
        st.rejoin_needed = false;
        crate::log!("mc: rejoined at index {}", st.node_index);
    }
    tx_needed
}

/// An initiator hands a known requester its old index back pre-commit, so
/// the node does not have to wait for the full admission cycle.
fn initiator_try_rejoin<V: MergeValue>(st: &NodeState, tx: &mut Packet<V>) -> bool {
    if !st.is_initiator || tx.rejoin_slot != 0 {
        return false;
    }
    for i in 0..tx.join.slot_count as usize {
        let id = tx.join.slots[i];
        if id == 0 {
            continue;
        }
        if let Some(index) = st.table.index_for(id) {
            tx.rejoin_slot = id;
            tx.rejoin_index = index;
            crate::log!("mc: rejoining node {} at index {}", id, index);
            return true;
        }
    }
    false
}

/// Remove every member whose leave bit is set. The caller has already
/// cleared the bits that must survive.
fn purge_leavers(st: &mut NodeState, leaves: &[u8; FLAGS_LEN]) {
    for i in 0..MAX_NODE_COUNT {
        if st.joined_nodes[i] != 0 && bitmap::test_bit(leaves, i) {
            crate::log!("mc: removing node {} at index {}", st.joined_nodes[i], i);
            st.joined_nodes[i] = 0;
            st.node_count = st.node_count.saturating_sub(1);
        }
    }
}

fn handle_coordination_round<V: MergeValue>(
    st: &mut NodeState,
    s: &mut RoundScratch<V>,
    cfg: &RoundConfig,
    slot: u16,
    rx: &Packet<V>,
) -> bool {
    let mut tx_needed = false;

    if s.tx.round_type == RoundType::Unknown {
        // the seed already carries our proposal
        s.tx.round_type = RoundType::Coordination;
    }

    if s.tx.phase == rx.phase {
        let (merge_tx, flags_complete, rx_complete) = merge_flags(s, rx);
        tx_needed |= merge_tx;

        if s.tx.phase == Phase::Merge {
            tx_needed |= handle_rejoin(st, s, rx);

            // fold the received proposal into ours
            if let (Payload::Value(tx_value), Payload::Value(rx_value)) =
                (&mut s.tx.payload, &rx.payload)
            {
                tx_value.merge(rx_value);
            }

            let (join_tx, delta) = join::merge_requests(&mut s.tx.join, &rx.join);
            tx_needed |= join_tx;
            if delta {
                s.delta_at_slot = slot;
            }

            if st.is_initiator {
                let quiescent =
                    cfg.commit_threshold > 0 && slot >= s.delta_at_slot + cfg.commit_threshold;
                if flags_complete && (slot >= cfg.max_commit_slot || quiescent) {
                    commit_coordination(st, s);
                    tx_needed = true;
                } else if delta {
                    tx_needed |= initiator_try_rejoin(st, &mut s.tx);
                }
            }
        } else if flags_complete {
            // commit phase: only confirm and spread the final state
            tx_needed = true;
            if !s.complete {
                s.completion_slot = slot;
            }
            s.complete = true;
            s.rx_progress |= rx_complete;
        }
    } else if s.tx.phase < rx.phase {
        adopt_coordination_commit(st, s, rx);
        tx_needed = true;
    } else {
        // we are ahead; keep transmitting so the peers catch up
        tx_needed = true;
    }

    tx_needed
}

/// The initiator decision: freeze the merged state, admit joiners, purge
/// leavers and move the round to COMMIT.
fn commit_coordination<V: MergeValue>(st: &mut NodeState, s: &mut RoundScratch<V>) {
    s.tx.flags = [0; FLAGS_LEN];
    bitmap::set_bit(&mut s.tx.flags, st.node_index as usize);
    s.tx.phase = Phase::Commit;

    crate::log!("mc: commit with {} join requests", s.tx.join.slot_count);
    for i in 0..s.tx.join.slot_count as usize {
        let id = s.tx.join.slots[i];
        if id == 0 {
            continue;
        }
        match st.table.add_node(id, &mut st.joined_nodes, &mut st.node_count) {
            Some(index) => {
                s.tx.join.indices[i] = index;
                bitmap::clear_bit(&mut s.tx.leaves, index as usize);
                crate::log!("mc: admitted node {} at index {}", id, index);
            }
            None => {
                s.tx.join.overflow = true;
                // a zeroed slot keeps the requester from assuming index 0
                s.tx.join.slots[i] = 0;
            }
        }
    }

    s.tx.rejoin_slot = 0;
    s.tx.rejoin_index = 0;

    // everyone flagged as leaving goes, except the committing node itself
    bitmap::clear_bit(&mut s.tx.leaves, st.node_index as usize);
    let leaves = s.tx.leaves;
    purge_leavers(st, &leaves);

    // indices still present stay in the completeness mask
    bitmap::or_complement_into(&mut s.join_masks, &leaves);

    s.tx.join.node_count = st.node_count;
    s.tx.join.commit = true;
}

/// The received packet is a phase ahead: take it over wholesale and derive
/// our own membership consequences from it.
fn adopt_coordination_commit<V: MergeValue>(
    st: &mut NodeState,
    s: &mut RoundScratch<V>,
    rx: &Packet<V>,
) {
    s.tx = rx.clone();
    st.node_count = rx.join.node_count;

    let leaves = s.tx.leaves;
    bitmap::or_complement_into(&mut s.join_masks, &leaves);

    if !st.has_node_index {
        // the joiner list is unordered; scan every slot
        for i in 0..rx.join.slot_count.min(JOIN_SLOTS as u8) as usize {
            if rx.join.slots[i] == st.node_id {
                st.node_index = rx.join.indices[i];
                st.has_node_index = true;
                s.joined = true;
                st.rejoin_needed = false;
                crate::log!("mc: joined at index {}", st.node_index);
                break;
            }
        }
    }

    if st.has_node_index {
        bitmap::set_bit(&mut s.tx.flags, st.node_index as usize);
        // a set leave bit in the committed state means we are out
        if bitmap::test_bit(&s.tx.leaves, st.node_index as usize) {
            st.has_node_index = false;
            st.node_index = 0;
            s.left = true;
            crate::log!("mc: left the network");
        }
    } else {
        s.tx.join.overflow = true;
    }
}

fn handle_election_round<V: MergeValue>(
    st: &mut NodeState,
    s: &mut RoundScratch<V>,
    wanted_priority: u16,
    slot: u16,
    rx: &Packet<V>,
) -> bool {
    let mut tx_needed = false;

    if s.tx.round_type == RoundType::Unknown {
        // wipe the coordination payload and enter the election; only
        // indexed nodes put themselves up as candidates
        let mut seed = Election::default();
        if st.has_node_index {
            seed.leader_node_id = st.node_id;
            seed.priority = wanted_priority;
        }
        s.tx.payload = Payload::Election(seed);
        s.tx.round_type = RoundType::ElectionAndHandover;
    }

    if s.tx.phase == rx.phase {
        let (merge_tx, flags_complete, rx_complete) = merge_flags(s, rx);
        tx_needed |= merge_tx;

        if s.tx.phase == Phase::Merge {
            tx_needed |= handle_rejoin(st, s, rx);

            let (join_tx, delta) = join::merge_requests(&mut s.tx.join, &rx.join);
            tx_needed |= join_tx;
            if delta {
                s.delta_at_slot = slot;
            }

            if let (Payload::Election(tx_e), Payload::Election(rx_e)) =
                (&mut s.tx.payload, &rx.payload)
            {
                tx_needed |= election::merge(tx_e, rx_e);
            }

            let elected = match s.tx.election() {
                Some(e) => {
                    st.has_node_index
                        && e.leader_node_id == st.node_id
                        && flags_complete
                        && e.joined_nodes[st.node_index as usize] == st.node_id
                }
                None => false,
            };
            if elected {
                commit_election(st, s);
                tx_needed = true;
            } else if delta {
                tx_needed |= initiator_try_rejoin(st, &mut s.tx);
            }
        } else if flags_complete {
            tx_needed = true;
            if !s.complete {
                s.completion_slot = slot;
            }
            s.complete = true;
            s.rx_progress |= rx_complete;
        }
    } else if s.tx.phase < rx.phase {
        s.tx = rx.clone();
        if st.is_initiator {
            let deposed = match s.tx.election() {
                Some(e) => e.leader_node_id != st.node_id,
                None => true,
            };
            if deposed {
                // someone else just took the lead
                st.is_initiator = false;
            }
        }
        st.node_count = rx.join.node_count;
        if st.has_node_index {
            bitmap::set_bit(&mut s.tx.flags, st.node_index as usize);
            if bitmap::test_bit(&s.tx.leaves, st.node_index as usize) {
                st.has_node_index = false;
                st.node_index = 0;
                s.left = true;
                crate::log!("mc: left the network");
            }
        }
        tx_needed = true;
    } else {
        tx_needed = true;
    }

    tx_needed
}

/// The winning candidate takes over: adopt the merged member list, become
/// the initiator and flood the commit.
fn commit_election<V: MergeValue>(st: &mut NodeState, s: &mut RoundScratch<V>) {
    st.is_initiator = true;
    if let Some(e) = s.tx.election() {
        st.joined_nodes = e.joined_nodes;
    }
    crate::log!("mc: elected as initiator");

    s.tx.flags = [0; FLAGS_LEN];
    bitmap::set_bit(&mut s.tx.flags, st.node_index as usize);
    s.tx.phase = Phase::Commit;
    s.tx.rejoin_slot = 0;
    s.tx.rejoin_index = 0;

    // the fresh leader may not leave through its own commit
    bitmap::clear_bit(&mut s.tx.leaves, st.node_index as usize);
    let leaves = s.tx.leaves;
    purge_leavers(st, &leaves);

    s.tx.join.node_count = st.node_count;
    s.tx.join.commit = true;
}
