//! On-air packet layout and codec.
//!
//! The packet is byte-exact and little-endian:
//!
//! ```text
//! [control:1][rejoin_slot:2][rejoin_index:1][join_data:17]
//! [union(election|value): max(|E|,|V|)][flags:FLAGS_LEN][leaves:FLAGS_LEN]
//! ```
//!
//! `control` packs the round type into its low 2 bits and the phase into the
//! upper 6. The numeric phase and type values are wire contract and must not
//! be renumbered.

use alloc::vec;
use alloc::vec::Vec;
use static_assertions::const_assert;

use crate::config::{FLAGS_LEN, JOIN_SLOTS, MAX_NODE_COUNT};
use crate::value::MergeValue;
use crate::{NodeId, NodeIndex};

pub const PHASE_MERGE: u8 = 4;
pub const PHASE_COMMIT: u8 = 8;

pub const TYPE_UNKNOWN: u8 = 0;
pub const TYPE_ELECTION_AND_HANDOVER: u8 = 1;
pub const TYPE_COORDINATION: u8 = 2;

// control packs phase:6 | type:2
const_assert!(PHASE_COMMIT < 1 << 6);
const_assert!(TYPE_COORDINATION < 1 << 2);

/// Round phase. `Merge` ORs proposals together, `Commit` floods the final
/// state; a node's phase never regresses within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Merge = PHASE_MERGE,
    Commit = PHASE_COMMIT,
}

/// Round type, fixed by the initiator and adopted by the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundType {
    Unknown = TYPE_UNKNOWN,
    ElectionAndHandover = TYPE_ELECTION_AND_HANDOVER,
    Coordination = TYPE_COORDINATION,
}

/// Codec failures; the engine treats any of them as an invalid slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Truncated,
    UnknownType,
    UnknownPhase,
}

/// Join bookkeeping carried in every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinData {
    /// Round-configuration sequence number; arbitration token between
    /// concurrent coordinators.
    pub config: u16,
    pub node_count: u8,
    /// Number of occupied entries in `slots`.
    pub slot_count: u8,
    /// Set by the initiator on the commit that admits the joiners.
    pub commit: bool,
    /// No free index was left for at least one requester.
    pub overflow: bool,
    /// Node ids asking to join.
    pub slots: [NodeId; JOIN_SLOTS],
    /// Indices assigned on commit, parallel to `slots`.
    pub indices: [NodeIndex; JOIN_SLOTS],
}

pub const JOIN_DATA_WIRE: usize = 2 + 1 + 1 + 1 + 2 * JOIN_SLOTS + JOIN_SLOTS;

/// Election payload for handover rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Election {
    pub leader_node_id: NodeId,
    pub priority: u16,
    pub joined_nodes: [NodeId; MAX_NODE_COUNT],
}

impl Election {
    /// Seed for one participant. The initiator contributes its
    /// authoritative member list; everyone else leaves it zero and adopts
    /// entries from received packets.
    pub fn seed(node_id: NodeId, priority: u16, joined: Option<&[NodeId; MAX_NODE_COUNT]>) -> Self {
        Self {
            leader_node_id: node_id,
            priority,
            joined_nodes: joined.copied().unwrap_or([0; MAX_NODE_COUNT]),
        }
    }
}

pub const ELECTION_WIRE: usize = 2 + 2 + 2 * MAX_NODE_COUNT;

/// The dual-typed region of the packet, keyed by `control.type`.
/// `Unknown` and `Coordination` packets carry a value, election packets
/// carry the election state.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<V> {
    Value(V),
    Election(Election),
}

/// One merge-commit packet, in memory. [`Packet::encode_into`] and
/// [`Packet::decode`] map it onto the packed on-air bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet<V> {
    pub phase: Phase,
    pub round_type: RoundType,
    /// Single-node rejoin channel published by the initiator pre-commit.
    pub rejoin_slot: NodeId,
    pub rejoin_index: NodeIndex,
    pub join: JoinData,
    pub payload: Payload<V>,
    pub flags: [u8; FLAGS_LEN],
    pub leaves: [u8; FLAGS_LEN],
}

const OFF_CONTROL: usize = 0;
const OFF_REJOIN_SLOT: usize = 1;
const OFF_REJOIN_INDEX: usize = 3;
const OFF_JOIN: usize = 4;
const OFF_UNION: usize = OFF_JOIN + JOIN_DATA_WIRE;

const fn max2(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

impl<V: MergeValue> Default for Packet<V> {
    fn default() -> Self {
        Self {
            phase: Phase::Merge,
            round_type: RoundType::Unknown,
            rejoin_slot: 0,
            rejoin_index: 0,
            join: JoinData::default(),
            payload: Payload::Value(V::default()),
            flags: [0; FLAGS_LEN],
            leaves: [0; FLAGS_LEN],
        }
    }
}

impl<V: MergeValue> Packet<V> {
    /// Size of the election/value union region.
    pub const UNION_LEN: usize = max2(ELECTION_WIRE, V::WIRE_SIZE);

    /// Exact on-air size of one packet.
    pub const WIRE_SIZE: usize = OFF_UNION + Self::UNION_LEN + 2 * FLAGS_LEN;

    const OFF_FLAGS: usize = OFF_UNION + Self::UNION_LEN;
    const OFF_LEAVES: usize = Self::OFF_FLAGS + FLAGS_LEN;

    /// The committed/working value, when this packet carries one.
    pub fn value(&self) -> Option<&V> {
        match &self.payload {
            Payload::Value(v) => Some(v),
            Payload::Election(_) => None,
        }
    }

    pub fn election(&self) -> Option<&Election> {
        match &self.payload {
            Payload::Election(e) => Some(e),
            Payload::Value(_) => None,
        }
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let out = &mut out[..Self::WIRE_SIZE];
        out.fill(0);

        out[OFF_CONTROL] = (self.phase as u8) << 2 | self.round_type as u8;
        out[OFF_REJOIN_SLOT..OFF_REJOIN_SLOT + 2].copy_from_slice(&self.rejoin_slot.to_le_bytes());
        out[OFF_REJOIN_INDEX] = self.rejoin_index;
        encode_join(&self.join, &mut out[OFF_JOIN..OFF_UNION]);
        match &self.payload {
            Payload::Value(v) => v.encode(&mut out[OFF_UNION..OFF_UNION + V::WIRE_SIZE]),
            Payload::Election(e) => encode_election(e, &mut out[OFF_UNION..OFF_UNION + ELECTION_WIRE]),
        }
        out[Self::OFF_FLAGS..Self::OFF_FLAGS + FLAGS_LEN].copy_from_slice(&self.flags);
        out[Self::OFF_LEAVES..Self::OFF_LEAVES + FLAGS_LEN].copy_from_slice(&self.leaves);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; Self::WIRE_SIZE];
        // buffer is sized exactly, encoding cannot fail
        let _ = self.encode_into(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let control = buf[OFF_CONTROL];
        let round_type = match control & 0b11 {
            TYPE_UNKNOWN => RoundType::Unknown,
            TYPE_ELECTION_AND_HANDOVER => RoundType::ElectionAndHandover,
            TYPE_COORDINATION => RoundType::Coordination,
            _ => return Err(WireError::UnknownType),
        };
        let phase = match control >> 2 {
            PHASE_MERGE => Phase::Merge,
            PHASE_COMMIT => Phase::Commit,
            _ => return Err(WireError::UnknownPhase),
        };
        let payload = match round_type {
            RoundType::ElectionAndHandover => {
                Payload::Election(decode_election(&buf[OFF_UNION..OFF_UNION + ELECTION_WIRE]))
            }
            _ => Payload::Value(V::decode(&buf[OFF_UNION..OFF_UNION + V::WIRE_SIZE])),
        };
        let mut flags = [0; FLAGS_LEN];
        flags.copy_from_slice(&buf[Self::OFF_FLAGS..Self::OFF_FLAGS + FLAGS_LEN]);
        let mut leaves = [0; FLAGS_LEN];
        leaves.copy_from_slice(&buf[Self::OFF_LEAVES..Self::OFF_LEAVES + FLAGS_LEN]);
        Ok(Self {
            phase,
            round_type,
            rejoin_slot: u16::from_le_bytes([buf[OFF_REJOIN_SLOT], buf[OFF_REJOIN_SLOT + 1]]),
            rejoin_index: buf[OFF_REJOIN_INDEX],
            join: decode_join(&buf[OFF_JOIN..OFF_UNION]),
            payload,
            flags,
            leaves,
        })
    }
}

fn encode_join(jd: &JoinData, out: &mut [u8]) {
    out[0..2].copy_from_slice(&jd.config.to_le_bytes());
    out[2] = jd.node_count;
    out[3] = jd.slot_count;
    out[4] = jd.commit as u8 | (jd.overflow as u8) << 1;
    let mut off = 5;
    for slot in &jd.slots {
        out[off..off + 2].copy_from_slice(&slot.to_le_bytes());
        off += 2;
    }
    for index in &jd.indices {
        out[off] = *index;
        off += 1;
    }
}

fn decode_join(buf: &[u8]) -> JoinData {
    let mut jd = JoinData {
        config: u16::from_le_bytes([buf[0], buf[1]]),
        node_count: buf[2],
        slot_count: buf[3].min(JOIN_SLOTS as u8),
        commit: buf[4] & 0b01 != 0,
        overflow: buf[4] & 0b10 != 0,
        ..JoinData::default()
    };
    let mut off = 5;
    for slot in jd.slots.iter_mut() {
        *slot = u16::from_le_bytes([buf[off], buf[off + 1]]);
        off += 2;
    }
    for index in jd.indices.iter_mut() {
        *index = buf[off];
        off += 1;
    }
    jd
}

fn encode_election(e: &Election, out: &mut [u8]) {
    out[0..2].copy_from_slice(&e.leader_node_id.to_le_bytes());
    out[2..4].copy_from_slice(&e.priority.to_le_bytes());
    let mut off = 4;
    for id in &e.joined_nodes {
        out[off..off + 2].copy_from_slice(&id.to_le_bytes());
        off += 2;
    }
}

fn decode_election(buf: &[u8]) -> Election {
    let mut e = Election {
        leader_node_id: u16::from_le_bytes([buf[0], buf[1]]),
        priority: u16::from_le_bytes([buf[2], buf[3]]),
        joined_nodes: [0; MAX_NODE_COUNT],
    };
    let mut off = 4;
    for id in e.joined_nodes.iter_mut() {
        *id = u16::from_le_bytes([buf[off], buf[off + 1]]);
        off += 2;
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Max32;

    #[test]
    fn control_byte_packs_phase_and_type() {
        let mut pkt = Packet::<Max32>::default();
        pkt.phase = Phase::Merge;
        pkt.round_type = RoundType::Coordination;
        let bytes = pkt.to_vec();
        assert_eq!(bytes[0], (PHASE_MERGE << 2) | TYPE_COORDINATION);

        pkt.phase = Phase::Commit;
        assert_eq!(pkt.to_vec()[0], (PHASE_COMMIT << 2) | TYPE_COORDINATION);
    }

    #[test]
    fn field_offsets_match_the_packed_layout() {
        let mut pkt = Packet::<Max32>::default();
        pkt.round_type = RoundType::Coordination;
        pkt.rejoin_slot = 0x0201;
        pkt.rejoin_index = 7;
        pkt.join.config = 0x0403;
        pkt.join.node_count = 3;
        pkt.join.slot_count = 1;
        pkt.join.commit = true;
        pkt.join.slots[0] = 0x0605;
        pkt.payload = Payload::Value(Max32(0x0A090807));
        pkt.flags[0] = 0xAA;
        pkt.leaves[0] = 0x55;

        let bytes = pkt.to_vec();
        assert_eq!(bytes.len(), Packet::<Max32>::WIRE_SIZE);
        assert_eq!(&bytes[1..3], &[0x01, 0x02]);
        assert_eq!(bytes[3], 7);
        assert_eq!(&bytes[4..6], &[0x03, 0x04]); // join.config
        assert_eq!(bytes[6], 3); // join.node_count
        assert_eq!(bytes[7], 1); // join.slot_count
        assert_eq!(bytes[8], 0b01); // commit bit
        assert_eq!(&bytes[9..11], &[0x05, 0x06]); // first join slot
        // union region starts right after join data
        assert_eq!(&bytes[OFF_UNION..OFF_UNION + 4], &[0x07, 0x08, 0x09, 0x0A]);
        // value is smaller than the election arm, rest of the union is padding
        assert_eq!(bytes[OFF_UNION + 4], 0);
        let off_flags = Packet::<Max32>::OFF_FLAGS;
        assert_eq!(bytes[off_flags], 0xAA);
        assert_eq!(bytes[off_flags + FLAGS_LEN], 0x55);
    }

    #[test]
    fn union_region_is_sized_for_the_larger_arm() {
        assert_eq!(Packet::<Max32>::UNION_LEN, ELECTION_WIRE);
        assert_eq!(ELECTION_WIRE, 4 + 2 * MAX_NODE_COUNT);
    }

    #[test]
    fn decode_inverts_encode_for_both_arms() {
        let mut pkt = Packet::<Max32>::default();
        pkt.phase = Phase::Commit;
        pkt.round_type = RoundType::Coordination;
        pkt.join.slots[0] = 42;
        pkt.join.slot_count = 1;
        pkt.payload = Payload::Value(Max32(99));
        pkt.flags = [0x0F; FLAGS_LEN];
        assert_eq!(Packet::<Max32>::decode(&pkt.to_vec()), Ok(pkt.clone()));

        pkt.round_type = RoundType::ElectionAndHandover;
        pkt.payload = Payload::Election(Election::seed(9, 5, None));
        assert_eq!(Packet::<Max32>::decode(&pkt.to_vec()), Ok(pkt));
    }

    #[test]
    fn corrupt_control_is_rejected() {
        let mut bytes = Packet::<Max32>::default().to_vec();
        bytes[0] = (PHASE_MERGE << 2) | 0b11;
        assert_eq!(Packet::<Max32>::decode(&bytes), Err(WireError::UnknownType));
        bytes[0] = 63 << 2;
        assert_eq!(Packet::<Max32>::decode(&bytes), Err(WireError::UnknownPhase));
        assert_eq!(
            Packet::<Max32>::decode(&bytes[..10]),
            Err(WireError::Truncated)
        );
    }
}
