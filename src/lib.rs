#![no_std]

//! Synchromesh: slotted merge-commit agreement for concurrent-transmission
//! wireless meshes.
//!
//! The root crate bundles the protocol core and the radio abstraction
//! layer, and adds the reference application (intersection path
//! reservation) plus a deterministic lockstep mesh simulator that stands in
//! for a radio testbed on the host.

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod intersection;
pub mod sim;

pub use synchromesh_core::{
    ConfigError, Max32, MergeCommit, MergeValue, NodeId, NodeIndex, OutcomeFlags, Packet, Phase,
    RejoinReason, RoundConfig, RoundReport, RoundType, SlotStats, WantedJoinState, MAX_NODE_COUNT,
};
pub use synchromesh_hal::{ChaosState, Flooding, LoopbackFlooding, RandomSource, SoftRng};
