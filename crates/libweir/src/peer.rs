use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use weir_core::Id20;
use weir_peer_protocol::Request;

use crate::bandwidth::RATEHISTORY;
use crate::reader::Reader;
use crate::sendq::{PieceReq, SendQueue};
use crate::type_aliases::{BF, PeerHandle, TorrentId};

/// Protocol-visible connection state. Both sides start out choked and
/// uninterested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// We choke the peer (suppress its requests).
    pub i_choke: bool,
    /// We are interested in the peer's pieces.
    pub i_want: bool,
    /// The peer chokes us.
    pub p_choke: bool,
    /// The peer is interested in our pieces.
    pub p_want: bool,
    /// Parked on the global read queue waiting for inbound budget.
    pub on_readq: bool,
    /// Parked on the global write queue waiting for outbound budget.
    pub on_writeq: bool,
    /// The peer sent EOF while we still had queued data; drain the
    /// queue, then close.
    pub write_close: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            i_choke: true,
            i_want: false,
            p_choke: true,
            p_want: false,
            on_readq: false,
            on_writeq: false,
            write_close: false,
        }
    }
}

pub(crate) struct Peer {
    pub addr: SocketAddr,
    pub sock: Arc<TcpStream>,
    pub incoming: bool,
    /// The remote's peer id: learned from the handshake for incoming
    /// connections, expected (and verified) for outgoing ones.
    pub id: Id20,
    /// Bound during (incoming) or before (outgoing) the handshake.
    pub tp: Option<TorrentId>,
    pub flags: PeerFlags,
    /// Kill requested mid-dispatch; the connection dies at the next
    /// flush and stops processing input meanwhile.
    pub closing: bool,
    /// One-shot readiness registrations currently outstanding.
    pub read_armed: bool,
    pub write_armed: bool,
    /// Bytes of piece payload received from / sent to this peer, one
    /// slot per second, indexed by `seconds % RATEHISTORY`.
    pub rate_to_me: [u64; RATEHISTORY],
    pub rate_from_me: [u64; RATEHISTORY],
    pub reader: Reader,
    pub outq: SendQueue,
    /// Requests from the peer we've honored but not fully written.
    pub p_reqs: VecDeque<PieceReq>,
    /// Our requests to the peer not yet fulfilled.
    pub my_reqs: VecDeque<Request>,
    /// Mirror of the remote's piece ownership, allocated when the
    /// handshake completes.
    pub piece_field: BF,
    /// Popcount of `piece_field`.
    pub npieces: u32,
}

impl Peer {
    pub fn new(addr: SocketAddr, sock: Arc<TcpStream>, incoming: bool, reader: Reader) -> Self {
        Self {
            addr,
            sock,
            incoming,
            id: Id20::default(),
            tp: None,
            flags: PeerFlags::default(),
            closing: false,
            read_armed: false,
            write_armed: false,
            rate_to_me: [0; RATEHISTORY],
            rate_from_me: [0; RATEHISTORY],
            reader,
            outq: SendQueue::default(),
            p_reqs: VecDeque::new(),
            my_reqs: VecDeque::new(),
            piece_field: BF::new(),
            npieces: 0,
        }
    }

    pub fn rate_to_me_sum(&self) -> u64 {
        self.rate_to_me.iter().sum()
    }

    pub fn rate_from_me_sum(&self) -> u64 {
        self.rate_from_me.iter().sum()
    }
}

pub(crate) type PeerMap = std::collections::HashMap<PeerHandle, Peer>;
