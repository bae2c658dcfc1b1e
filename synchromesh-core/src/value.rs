//! Application value contract for the merge phase.

/// A value the network can agree on within one round.
///
/// `merge` folds a received proposal into the local one. It must be
/// commutative, associative and idempotent so that any merge order over the
/// flood converges to the same committed value, regardless of which packets
/// each node happened to witness.
pub trait MergeValue: Clone + Default + PartialEq {
    /// Encoded size on the wire in bytes.
    const WIRE_SIZE: usize;

    /// Write exactly [`Self::WIRE_SIZE`] bytes into `out`.
    fn encode(&self, out: &mut [u8]);

    /// Read exactly [`Self::WIRE_SIZE`] bytes from `buf`.
    fn decode(buf: &[u8]) -> Self;

    /// Fold the received proposal into `self`.
    fn merge(&mut self, rx: &Self);
}

/// Maximum-wins reference value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Max32(pub u32);

impl MergeValue for Max32 {
    const WIRE_SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.0.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Max32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    fn merge(&mut self, rx: &Self) {
        if rx.0 > self.0 {
            self.0 = rx.0;
        }
    }
}
