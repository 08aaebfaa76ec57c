pub mod hash_id;
pub mod lengths;
pub mod peer_id;

pub use hash_id::Id20;
pub use lengths::{Lengths, ValidPieceIndex};
