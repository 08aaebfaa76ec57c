pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// Stable id of a peer connection. Handles are never reused, so a
/// readiness event that outlives its peer simply misses.
pub type PeerHandle = u64;

pub type TorrentId = u32;
