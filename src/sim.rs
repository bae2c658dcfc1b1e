//! Deterministic lockstep mesh simulator.
//!
//! Stands in for a radio testbed on the host: every node advances slot by
//! slot, one transmitter's payload is delivered to each listener (seeded
//! choice, modelling the capture effect) and receive losses are injected at
//! a configurable rate. All randomness comes from one seeded generator, so
//! a failing run replays byte for byte.

use alloc::vec;
use alloc::vec::Vec;

use synchromesh_core::{
    ConfigError, MergeCommit, MergeValue, NodeId, RoundConfig, RoundReport, MAX_NODE_COUNT,
};
use synchromesh_hal::{ChaosState, RandomSource, SlotHandler, SoftRng};

/// A fully connected mesh of protocol instances.
pub struct Mesh<V: MergeValue> {
    pub nodes: Vec<MergeCommit<V, SoftRng>>,
    rng: SoftRng,
    /// Lose roughly one reception in `loss_rate`; 0 disables losses, 1
    /// loses everything.
    pub loss_rate: u32,
}

impl<V: MergeValue> Mesh<V> {
    pub fn new(nodes: Vec<MergeCommit<V, SoftRng>>, seed: u32) -> Self {
        Self { nodes, rng: SoftRng::new(seed), loss_rate: 0 }
    }

    /// Build an established mesh: `ids[0]` is the initiator and every id
    /// holds the index matching its position, as after a committed join of
    /// all members.
    pub fn established(ids: &[NodeId], config: RoundConfig, seed: u32) -> Result<Self, ConfigError> {
        assert!(!ids.is_empty() && ids.len() <= MAX_NODE_COUNT);
        let mut joined = [0; MAX_NODE_COUNT];
        for (i, &id) in ids.iter().enumerate() {
            joined[i] = id;
        }
        let mut nodes = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            let rng = SoftRng::new(seed.wrapping_add(1).wrapping_mul(id as u32));
            let mut node = MergeCommit::new(id, config, rng)?;
            let st = node.state_mut();
            st.has_node_index = true;
            st.node_index = i as u8;
            st.node_count = ids.len() as u8;
            st.joined_nodes = joined;
            st.table.rebuild(&joined);
            st.is_initiator = i == 0;
            nodes.push(node);
        }
        Ok(Self::new(nodes, seed))
    }

    /// Add a fresh, unindexed node (a joiner) to the mesh.
    pub fn push_node(&mut self, node: MergeCommit<V, SoftRng>) {
        self.nodes.push(node);
    }

    pub fn node(&self, i: usize) -> &MergeCommit<V, SoftRng> {
        &self.nodes[i]
    }

    pub fn node_mut(&mut self, i: usize) -> &mut MergeCommit<V, SoftRng> {
        &mut self.nodes[i]
    }

    /// Run one whole round. `values[i]` is node i's proposal going in and
    /// holds the published value coming out.
    pub fn run_round(&mut self, round_number: u16, values: &mut [V]) -> Vec<RoundReport> {
        assert_eq!(self.nodes.len(), values.len());
        let n = self.nodes.len();

        let mut bufs: Vec<Vec<u8>> = self
            .nodes
            .iter_mut()
            .zip(values.iter())
            .map(|(node, value)| node.begin_round(round_number, value))
            .collect();
        let mut states = vec![ChaosState::Init; n];
        let max_slots = self.nodes[0].config().max_slots;

        for slot in 0..max_slots {
            // payloads on the air this slot
            let frames: Vec<Vec<u8>> = (0..n)
                .filter(|&i| states[i] == ChaosState::Tx)
                .map(|i| bufs[i].clone())
                .collect();

            for i in 0..n {
                if states[i] == ChaosState::Off {
                    continue;
                }
                let transmitting = states[i] == ChaosState::Tx;
                let lost = self.loss_rate > 0 && self.rng.rand_fast() % self.loss_rate == 0;
                let (success, rx): (bool, &[u8]) = if transmitting {
                    (true, &[])
                } else if frames.is_empty() || lost {
                    (false, &[])
                } else {
                    // capture effect: one transmitter gets through
                    let pick = self.rng.rand_fast() as usize % frames.len();
                    (true, frames[pick].as_slice())
                };
                let mut tx_buf = core::mem::take(&mut bufs[i]);
                states[i] =
                    self.nodes[i].process_slot(round_number, slot, states[i], success, rx, &mut tx_buf);
                bufs[i] = tx_buf;
            }

            if states.iter().all(|&st| st == ChaosState::Off) {
                break;
            }
        }

        self.nodes
            .iter_mut()
            .zip(values.iter_mut())
            .map(|(node, value)| node.finish_round(value))
            .collect()
    }
}
