#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Synchromesh merge-commit core
//!
//! Network-wide agreement executed as one slotted radio round on top of a
//! concurrent-transmission flooding primitive. Every round the mesh
//! converges from independent proposals to a single committed value while
//! carrying membership changes (join, leave, initiator handover) in-band.
//! The value payload is application-defined; any [`value::MergeValue`] whose
//! merge is commutative, associative and idempotent can be agreed on.

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod bitmap;
pub mod config;
pub mod election;
pub mod engine;
pub mod join;
pub mod log;
pub mod round;
pub mod stats;
pub mod value;
pub mod wire;

/// Network-unique node identifier; 0 means "no node".
pub type NodeId = u16;

/// Dense per-network slot index assigned on join.
pub type NodeIndex = u8;

pub use config::{ConfigError, RoundConfig, FLAGS_LEN, JOIN_SLOTS, MAX_NODE_COUNT};
pub use join::NodeTable;
pub use round::{
    MergeCommit, NodeState, OutcomeFlags, RejoinReason, RoundReport, WantedJoinState,
};
pub use stats::SlotStats;
pub use value::{Max32, MergeValue};
pub use wire::{Election, JoinData, Packet, Payload, Phase, RoundType, WireError};
