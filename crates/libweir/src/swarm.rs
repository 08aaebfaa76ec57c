use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use byteorder::{BE, ByteOrder};
use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, trace};
use weir_core::Id20;
use weir_peer_protocol::{
    HANDSHAKE_LEN, Handshake, MSGID_BITFIELD, Message, PIECE_PREAMBLE_LEN, Request,
    serialize_piece_preamble,
};

use crate::bandwidth::Bandwidth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::peer::{Peer, PeerFlags, PeerMap};
use crate::reader::Reader;
use crate::sendq::{IoBuf, PieceReq};
use crate::torrent::{Torrent, TorrentMeta};
use crate::type_aliases::{BF, PeerHandle, TorrentId};

/// An outbound connection waiting to be dialed.
pub(crate) struct Dial {
    pub torrent: TorrentId,
    pub addr: SocketAddr,
    pub peer_id: Id20,
}

/// All engine state: peers, torrents, bandwidth budgets and the work
/// the current dispatch has queued up (events to arm, peers to dial or
/// kill). Policy callbacks receive this to act on the swarm; everything
/// they trigger is flushed by the event loop afterwards.
pub struct Swarm {
    pub(crate) peer_id: Id20,
    pub(crate) max_peers: usize,
    pub(crate) npeers: usize,
    pub(crate) peers: PeerMap,
    next_peer: PeerHandle,
    pub(crate) torrents: HashMap<TorrentId, Torrent>,
    next_torrent: TorrentId,
    pub(crate) bw: Bandwidth,
    pub(crate) armq: Vec<(PeerHandle, Interest)>,
    pub(crate) dialq: Vec<Dial>,
    pub(crate) killq: Vec<PeerHandle>,
}

impl Swarm {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            peer_id: config.peer_id,
            max_peers: config.max_peers,
            npeers: 0,
            peers: PeerMap::new(),
            next_peer: 1,
            torrents: HashMap::new(),
            next_torrent: 1,
            bw: Bandwidth::new(config.download_bps, config.upload_bps),
            armq: Vec::new(),
            dialq: Vec::new(),
            killq: Vec::new(),
        }
    }

    pub(crate) fn add_torrent(&mut self, meta: TorrentMeta, piece_field: Option<BF>) -> TorrentId {
        let npieces = meta.lengths.total_pieces() as usize;
        let field = match piece_field {
            Some(f) => f,
            None => BF::repeat(false, npieces),
        };
        let id = self.next_torrent;
        self.next_torrent += 1;
        self.torrents.insert(id, Torrent::new(meta, field));
        id
    }

    pub(crate) fn add_peer(
        &mut self,
        addr: SocketAddr,
        sock: Arc<TcpStream>,
        incoming: bool,
        reader: Reader,
    ) -> PeerHandle {
        let h = self.next_peer;
        self.next_peer += 1;
        self.peers.insert(h, Peer::new(addr, sock, incoming, reader));
        h
    }

    pub(crate) fn peer_alive(&self, h: PeerHandle) -> bool {
        self.peers.get(&h).map(|p| !p.closing).unwrap_or(false)
    }

    pub(crate) fn torrent_has_peer(&self, torrent: TorrentId, id: &Id20) -> bool {
        let Some(t) = self.torrents.get(&torrent) else {
            return false;
        };
        t.peers
            .iter()
            .any(|h| self.peers.get(h).map(|p| &p.id == id).unwrap_or(false))
    }

    // Readiness is one-shot: arming pushes a single wait that the event
    // loop turns into a future; the flag stops double-arming.

    pub(crate) fn arm_read(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h)
            && !p.closing
            && !p.read_armed
        {
            p.read_armed = true;
            self.armq.push((h, Interest::READABLE));
        }
    }

    pub(crate) fn arm_write(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h)
            && !p.closing
            && !p.write_armed
        {
            p.write_armed = true;
            self.armq.push((h, Interest::WRITABLE));
        }
    }

    /// Append to the peer's send queue, arming the writable event if the
    /// queue was idle. Returns the queue id of the entry.
    pub(crate) fn enqueue(&mut self, h: PeerHandle, buf: IoBuf) -> u64 {
        let Some(p) = self.peers.get_mut(&h) else {
            return 0;
        };
        if p.outq.is_empty() && !p.closing && !p.write_armed {
            p.write_armed = true;
            self.armq.push((h, Interest::WRITABLE));
        }
        p.outq.push(buf)
    }

    fn enqueue_msg(&mut self, h: PeerHandle, msg: &Message<'_>) {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let len = msg.serialize(&mut buf).unwrap();
        self.enqueue(h, IoBuf::inline(&buf[..len]));
    }

    /// Choke the peer: suppress its requests from now on.
    pub fn send_choke(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h) {
            p.flags.i_choke = true;
            self.enqueue_msg(h, &Message::Choke);
        }
    }

    pub fn send_unchoke(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h) {
            p.flags.i_choke = false;
            self.enqueue_msg(h, &Message::Unchoke);
        }
    }

    pub fn send_interested(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h) {
            p.flags.i_want = true;
            self.enqueue_msg(h, &Message::Interested);
        }
    }

    pub fn send_not_interested(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h) {
            p.flags.i_want = false;
            self.enqueue_msg(h, &Message::NotInterested);
        }
    }

    pub fn send_have(&mut self, h: PeerHandle, index: u32) {
        if self.peers.contains_key(&h) {
            self.enqueue_msg(h, &Message::Have(index));
        }
    }

    /// Request a block from the peer. The request is remembered in wire
    /// order; an arriving PIECE is accepted only if it matches the
    /// oldest outstanding one.
    pub fn send_request(&mut self, h: PeerHandle, req: Request) {
        if let Some(p) = self.peers.get_mut(&h) {
            p.my_reqs.push_back(req);
            self.enqueue_msg(h, &Message::Request(req));
        }
    }

    /// Withdraw a previously sent request. The peer may still answer it;
    /// the forgotten request makes the answer fall on the floor.
    pub fn send_cancel(&mut self, h: PeerHandle, req: Request) {
        if let Some(p) = self.peers.get_mut(&h) {
            if let Some(pos) = p.my_reqs.iter().position(|r| *r == req) {
                p.my_reqs.remove(pos);
            }
            self.enqueue_msg(h, &Message::Cancel(req));
        }
    }

    /// Forget all outstanding requests to the peer, e.g. after a choke.
    pub fn clear_requests(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h) {
            p.my_reqs.clear();
        }
    }

    pub(crate) fn send_handshake(&mut self, h: PeerHandle) {
        let Some((info_hash, have_npieces)) = self
            .peers
            .get(&h)
            .and_then(|p| p.tp)
            .and_then(|tid| self.torrents.get(&tid))
            .map(|t| (*t.info_hash(), t.have_npieces()))
        else {
            return;
        };
        let mut buf = [0u8; HANDSHAKE_LEN];
        Handshake::new(info_hash, self.peer_id).serialize_unchecked_len(&mut buf);
        self.enqueue(h, IoBuf::inline(&buf));
        if have_npieces > 0 {
            self.send_bitfield(h);
        }
    }

    pub(crate) fn send_bitfield(&mut self, h: PeerHandle) {
        let Some(tid) = self.peers.get(&h).and_then(|p| p.tp) else {
            return;
        };
        let Some(t) = self.torrents.get(&tid) else {
            return;
        };
        let plen = t.lengths().piece_bitfield_bytes();
        let mut hdr = [0u8; 5];
        BE::write_u32(&mut hdr[0..4], plen as u32 + 1);
        hdr[4] = MSGID_BITFIELD;
        // snapshot the field; the live bitmap may change before the
        // queue drains
        let field = t.piece_field().as_raw_slice()[..plen]
            .to_vec()
            .into_boxed_slice();
        self.enqueue(h, IoBuf::inline(&hdr));
        self.enqueue(h, IoBuf::owned(field));
    }

    /// Queue a PIECE message: the 13-byte header plus the store-owned
    /// payload, remembered in `p_reqs` until both are on the wire.
    pub(crate) fn send_piece(&mut self, h: PeerHandle, index: u32, begin: u32, block: Bytes) {
        trace!(peer = h, index, begin, len = block.len(), "send piece");
        let length = block.len() as u32;
        let mut hdr = [0u8; PIECE_PREAMBLE_LEN];
        serialize_piece_preamble(index, begin, length, &mut hdr);
        let head_id = self.enqueue(h, IoBuf::inline(&hdr));
        self.enqueue(h, IoBuf::borrowed(block));
        if let Some(p) = self.peers.get_mut(&h) {
            p.p_reqs.push_back(PieceReq {
                index,
                begin,
                length,
                head_id,
            });
        }
    }

    /// Drop a queued-but-unsent PIECE (header and payload both) in
    /// response to a CANCEL. Returns false when no queued request
    /// matches.
    pub(crate) fn unsend_piece(
        &mut self,
        h: PeerHandle,
        index: u32,
        begin: u32,
        length: u32,
    ) -> bool {
        let Some(p) = self.peers.get_mut(&h) else {
            return false;
        };
        let Some(pos) = p
            .p_reqs
            .iter()
            .position(|r| r.index == index && r.begin == begin && r.length == length)
        else {
            return false;
        };
        let req = p.p_reqs.remove(pos).unwrap();
        p.outq.unsend(req.head_id);
        if p.outq.is_empty() && p.flags.on_writeq {
            p.flags.on_writeq = false;
            self.bw.writeq.retain(|x| *x != h);
        }
        debug!(peer = h, index, begin, length, "cancel matched");
        true
    }

    /// Queue an outbound connection to a peer of `torrent` whose id we
    /// already know (e.g. from a tracker response).
    pub fn connect(&mut self, torrent: TorrentId, addr: SocketAddr, peer_id: Id20) -> Result<()> {
        if !self.torrents.contains_key(&torrent) {
            return Err(Error::TorrentNotFound);
        }
        if self.npeers >= self.max_peers {
            return Err(Error::MaxPeers);
        }
        // the slot is taken now and given back if the dial fails
        self.npeers += 1;
        self.dialq.push(Dial {
            torrent,
            addr,
            peer_id,
        });
        Ok(())
    }

    /// Ask the engine to destroy a peer connection. Takes effect at the
    /// next flush; the peer's input is ignored from now on.
    pub fn disconnect(&mut self, h: PeerHandle) {
        if let Some(p) = self.peers.get_mut(&h)
            && !p.closing
        {
            p.closing = true;
            self.killq.push(h);
        }
    }

    // Read-only views for the policy layer.

    pub fn num_peers(&self) -> usize {
        self.npeers
    }

    pub fn torrent(&self, id: TorrentId) -> Option<&Torrent> {
        self.torrents.get(&id)
    }

    pub fn torrent_mut(&mut self, id: TorrentId) -> Option<&mut Torrent> {
        self.torrents.get_mut(&id)
    }

    pub fn torrents(&self) -> impl Iterator<Item = (TorrentId, &Torrent)> {
        self.torrents.iter().map(|(id, t)| (*id, t))
    }

    pub fn peer_addr(&self, h: PeerHandle) -> Option<SocketAddr> {
        self.peers.get(&h).map(|p| p.addr)
    }

    pub fn peer_id_of(&self, h: PeerHandle) -> Option<Id20> {
        self.peers.get(&h).map(|p| p.id)
    }

    pub fn peer_torrent(&self, h: PeerHandle) -> Option<TorrentId> {
        self.peers.get(&h).and_then(|p| p.tp)
    }

    pub fn peer_flags(&self, h: PeerHandle) -> Option<PeerFlags> {
        self.peers.get(&h).map(|p| p.flags)
    }

    /// The remote's piece bitmap as last announced.
    pub fn peer_bitfield(&self, h: PeerHandle) -> Option<&BF> {
        self.peers.get(&h).map(|p| &p.piece_field)
    }

    pub fn peer_npieces(&self, h: PeerHandle) -> Option<u32> {
        self.peers.get(&h).map(|p| p.npieces)
    }

    /// Sliding-window byte totals (received, sent) over the last
    /// RATEHISTORY seconds.
    pub fn peer_rates(&self, h: PeerHandle) -> Option<(u64, u64)> {
        self.peers
            .get(&h)
            .map(|p| (p.rate_to_me_sum(), p.rate_from_me_sum()))
    }

    pub fn pending_requests(&self, h: PeerHandle) -> Option<usize> {
        self.peers.get(&h).map(|p| p.my_reqs.len())
    }
}
