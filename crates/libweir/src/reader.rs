use arrayvec::ArrayVec;
use weir_peer_protocol::{HANDSHAKE_LEN, HANDSHAKE_PSTR_PREFIX};

/// Scratch for one generic read tick.
pub(crate) const GRBUFLEN: usize = 1 << 15;

/// Largest partial frame header carried between ticks: everything up to
/// but excluding the last byte of a REQUEST/CANCEL frame.
pub(crate) const MAX_INPUT_LEFT: usize = 17;

/// Where in the 68-byte handshake the reader currently is. States are
/// named after the field that was just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShakeState {
    Init,
    Pstr,
    Reserved,
    Info,
    Id,
}

/// What the handshake reader wants the caller to do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ShakeEvent {
    /// Not enough buffered bytes to advance.
    NeedMore,
    /// The protocol signature didn't match.
    Bad,
    /// 48 bytes buffered: the remote's info-hash is available.
    InfoHash([u8; 20]),
    /// All 68 bytes buffered: the remote's peer id is available and the
    /// handshake is complete.
    PeerId([u8; 20]),
}

pub(crate) struct HandshakeReader {
    pub incoming: bool,
    pub state: ShakeState,
    pub buf: [u8; HANDSHAKE_LEN],
    pub off: usize,
}

impl HandshakeReader {
    pub fn new(incoming: bool) -> Self {
        Self {
            incoming,
            state: ShakeState::Init,
            buf: [0u8; HANDSHAKE_LEN],
            off: 0,
        }
    }

    /// Advance as far as the buffered bytes allow. Returns at each point
    /// where the caller has to act (info-hash resolution, peer-id
    /// verification); call again afterwards to continue.
    pub fn step(&mut self) -> ShakeEvent {
        loop {
            match self.state {
                ShakeState::Init => {
                    if self.off < 20 {
                        return ShakeEvent::NeedMore;
                    }
                    if &self.buf[..20] != HANDSHAKE_PSTR_PREFIX {
                        return ShakeEvent::Bad;
                    }
                    self.state = ShakeState::Pstr;
                }
                ShakeState::Pstr => {
                    if self.off < 28 {
                        return ShakeEvent::NeedMore;
                    }
                    // reserved bytes accepted verbatim
                    self.state = ShakeState::Reserved;
                }
                ShakeState::Reserved => {
                    if self.off < 48 {
                        return ShakeEvent::NeedMore;
                    }
                    self.state = ShakeState::Info;
                    return ShakeEvent::InfoHash(self.buf[28..48].try_into().unwrap());
                }
                ShakeState::Info => {
                    if self.off < HANDSHAKE_LEN {
                        return ShakeEvent::NeedMore;
                    }
                    self.state = ShakeState::Id;
                    return ShakeEvent::PeerId(self.buf[48..68].try_into().unwrap());
                }
                ShakeState::Id => return ShakeEvent::NeedMore,
            }
        }
    }
}

pub(crate) struct GenericReader {
    /// Tail bytes of a partial frame header, replayed at the next tick.
    pub carry: ArrayVec<u8, MAX_INPUT_LEFT>,
}

impl GenericReader {
    pub fn new() -> Self {
        Self {
            carry: ArrayVec::new(),
        }
    }
}

pub(crate) struct BitfieldReader {
    pub buf: Box<[u8]>,
    pub off: usize,
}

pub(crate) struct PieceReader {
    pub index: u32,
    pub begin: u32,
    pub buf: Box<[u8]>,
    pub off: usize,
}

/// Per-connection input state. The variant transitions monotonically
/// from `Handshake` to `Generic`; `Bitfield` and `Piece` are temporary
/// detours that return to `Generic` when their target buffer fills.
pub(crate) enum Reader {
    Handshake(HandshakeReader),
    Generic(GenericReader),
    Bitfield(BitfieldReader),
    Piece(PieceReader),
}

impl Reader {
    pub fn handshake(incoming: bool) -> Self {
        Reader::Handshake(HandshakeReader::new(incoming))
    }

    pub fn generic() -> Self {
        Reader::Generic(GenericReader::new())
    }

    pub fn bitfield(target_len: usize, seed: &[u8]) -> Self {
        let mut buf = vec![0u8; target_len].into_boxed_slice();
        buf[..seed.len()].copy_from_slice(seed);
        Reader::Bitfield(BitfieldReader {
            buf,
            off: seed.len(),
        })
    }

    pub fn piece(index: u32, begin: u32, length: u32, seed: &[u8]) -> Self {
        let mut buf = vec![0u8; length as usize].into_boxed_slice();
        buf[..seed.len()].copy_from_slice(seed);
        Reader::Piece(PieceReader {
            index,
            begin,
            buf,
            off: seed.len(),
        })
    }

    pub fn completed_handshake(&self) -> bool {
        !matches!(self, Reader::Handshake(_))
    }
}
