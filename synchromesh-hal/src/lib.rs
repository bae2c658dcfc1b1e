#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Radio abstraction layer for Synchromesh
//!
//! This crate is the seam between the protocol core and the
//! concurrent-transmission flooding primitive. The core never touches the
//! radio directly; it sees one callback per slot through the traits defined
//! here, so the same protocol runs on real hardware back-ends, on the
//! loopback stub, or inside the host-side simulator.

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod radio;
pub mod random;

pub use radio::{ChaosState, Flooding, LoopbackFlooding, RadioError, RoundParams, SlotHandler};
pub use random::{RandomSource, SoftRng};
