// Socket-facing half of the engine: nonblocking reads dispatched
// through the per-peer reader state machine, the vectored send-queue
// drain, bandwidth-budgeted readiness handling and connection teardown.

use std::io;

use byteorder::{BE, ByteOrder};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use weir_core::{Id20, peer_id::try_decode_peer_id};
use weir_peer_protocol::{
    HANDSHAKE_LEN, MSGID_BITFIELD, MSGID_CANCEL, MSGID_CHOKE, MSGID_HAVE, MSGID_INTERESTED,
    MSGID_NOT_INTERESTED, MSGID_PIECE, MSGID_REQUEST, MSGID_UNCHOKE, Message,
};

use crate::error::Error;
use crate::msg;
use crate::policy::PolicyCallbacks;
use crate::reader::{GRBUFLEN, Reader, ShakeEvent};
use crate::store::TorrentStore;
use crate::swarm::Swarm;
use crate::type_aliases::{BF, PeerHandle};

/// Destroy a peer connection: unhook it from the park queues and its
/// torrent, close the socket and drop all queued buffers. Safe to call
/// from any point; a second call for the same handle does nothing.
pub(crate) fn peer_kill<P: PolicyCallbacks>(
    sw: &mut Swarm,
    policy: &mut P,
    h: PeerHandle,
    reason: Error,
) {
    let Some(p) = sw.peers.remove(&h) else {
        return;
    };
    debug!(peer = h, addr = %p.addr, "closing connection: {reason:#}");
    sw.bw.unlink(h);
    if let Some(tid) = p.tp
        && let Some(t) = sw.torrents.get_mut(&tid)
    {
        t.peers.retain(|x| *x != h);
    }
    sw.npeers -= 1;
    // abortive close; wakes any readiness wait still holding the socket
    let _ = socket2::SockRef::from(p.sock.as_ref()).shutdown(std::net::Shutdown::Both);
    let had_handshake = p.reader.completed_handshake();
    drop(p);
    if had_handshake {
        policy.on_lost_peer(sw, h);
    }
}

enum SockRead {
    Data(usize),
    Blocked,
    Eof,
    Failed(io::Error),
}

fn sock_read(sock: &TcpStream, dst: &mut [u8]) -> SockRead {
    debug_assert!(!dst.is_empty());
    loop {
        match sock.try_read(dst) {
            Ok(0) => return SockRead::Eof,
            Ok(n) => return SockRead::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SockRead::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return SockRead::Failed(e),
        }
    }
}

/// EOF disposition: keep the connection half-open while we still owe
/// the peer queued bytes, otherwise destroy it now.
fn on_read_eof<P: PolicyCallbacks>(sw: &mut Swarm, policy: &mut P, h: PeerHandle) {
    let Some(p) = sw.peers.get_mut(&h) else {
        return;
    };
    if !p.outq.is_empty() {
        debug!(peer = h, "conn closed by other side, draining outbound queue");
        p.flags.write_close = true;
    } else {
        peer_kill(sw, policy, h, Error::PeerDisconnected);
    }
}

/// Run the peer's current reader with a byte budget (`rmax == 0` means
/// unlimited). Returns the bytes consumed from the socket.
pub(crate) fn peer_read<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    rmax: u64,
) -> u64 {
    if !sw.peer_alive(h) {
        return 0;
    }
    enum Kind {
        Shake,
        Generic,
        Bitfield,
        Piece,
    }
    let kind = match sw.peers.get(&h).map(|p| &p.reader) {
        Some(Reader::Handshake(_)) => Kind::Shake,
        Some(Reader::Generic(_)) => Kind::Generic,
        Some(Reader::Bitfield(_)) => Kind::Bitfield,
        Some(Reader::Piece(_)) => Kind::Piece,
        None => return 0,
    };
    match kind {
        Kind::Shake => shake_read(sw, store, policy, h, rmax),
        Kind::Generic => generic_read(sw, store, policy, h, rmax),
        Kind::Bitfield => bitfield_read(sw, policy, h, rmax),
        Kind::Piece => piece_read(sw, store, policy, h, rmax),
    }
}

fn shake_read<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    rmax: u64,
) -> u64 {
    let r = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return 0;
        };
        let sock = p.sock.clone();
        let Reader::Handshake(hs) = &mut p.reader else {
            return 0;
        };
        let space = HANDSHAKE_LEN - hs.off;
        let want = if rmax == 0 {
            space
        } else {
            space.min(rmax as usize)
        };
        match sock_read(&sock, &mut hs.buf[hs.off..hs.off + want]) {
            SockRead::Data(n) => {
                hs.off += n;
                SockRead::Data(n)
            }
            other => other,
        }
    };
    let nread = match r {
        SockRead::Data(n) => n as u64,
        SockRead::Blocked => {
            sw.arm_read(h);
            return 0;
        }
        SockRead::Eof => {
            on_read_eof(sw, policy, h);
            return 0;
        }
        SockRead::Failed(e) => {
            peer_kill(sw, policy, h, Error::Read(e));
            return 0;
        }
    };

    loop {
        let (ev, incoming) = {
            let Some(p) = sw.peers.get_mut(&h) else {
                return nread;
            };
            let Reader::Handshake(hs) = &mut p.reader else {
                return nread;
            };
            (hs.step(), hs.incoming)
        };
        match ev {
            ShakeEvent::NeedMore => {
                sw.arm_read(h);
                return nread;
            }
            ShakeEvent::Bad => {
                peer_kill(sw, policy, h, Error::BadHandshake("bad protocol header"));
                return nread;
            }
            ShakeEvent::InfoHash(hash) => {
                let hash = Id20::new(hash);
                if incoming {
                    match store
                        .get_by_hash(&hash)
                        .filter(|tid| sw.torrents.contains_key(tid))
                    {
                        Some(tid) => {
                            if let Some(p) = sw.peers.get_mut(&h) {
                                p.tp = Some(tid);
                            }
                            sw.send_handshake(h);
                        }
                        None => {
                            peer_kill(sw, policy, h, Error::BadHandshake("unknown info hash"));
                            return nread;
                        }
                    }
                } else {
                    let expected = sw
                        .peers
                        .get(&h)
                        .and_then(|p| p.tp)
                        .and_then(|tid| sw.torrents.get(&tid))
                        .map(|t| *t.info_hash());
                    if expected != Some(hash) {
                        peer_kill(sw, policy, h, Error::BadHandshake("info hash mismatch"));
                        return nread;
                    }
                }
            }
            ShakeEvent::PeerId(id) => {
                let id = Id20::new(id);
                let Some(tid) = sw.peers.get(&h).and_then(|p| p.tp) else {
                    return nread;
                };
                if incoming {
                    if sw.torrent_has_peer(tid, &id) {
                        // not really bad, but we are already connected
                        peer_kill(sw, policy, h, Error::BadHandshake("duplicate peer id"));
                        return nread;
                    }
                    if let Some(p) = sw.peers.get_mut(&h) {
                        p.id = id;
                    }
                } else if sw.peers.get(&h).map(|p| p.id) != Some(id) {
                    peer_kill(sw, policy, h, Error::BadHandshake("unexpected peer id"));
                    return nread;
                }

                let Some(npieces) = sw
                    .torrents
                    .get(&tid)
                    .map(|t| t.lengths().total_pieces() as usize)
                else {
                    return nread;
                };
                if let Some(p) = sw.peers.get_mut(&h) {
                    p.piece_field = BF::repeat(false, npieces);
                    p.npieces = 0;
                    p.reader = Reader::generic();
                }
                if let Some(t) = sw.torrents.get_mut(&tid) {
                    t.peers.push(h);
                }
                trace!(peer = h, peer_id = ?id, decoded_id = ?try_decode_peer_id(id), "got whole handshake");
                policy.on_new_peer(sw, h);
                sw.arm_read(h);
                return nread;
            }
        }
    }
}

fn generic_read<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    rmax: u64,
) -> u64 {
    let mut buf = [0u8; GRBUFLEN];
    let (sock, carry_len) = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return 0;
        };
        let sock = p.sock.clone();
        let Reader::Generic(gr) = &mut p.reader else {
            return 0;
        };
        buf[..gr.carry.len()].copy_from_slice(&gr.carry);
        (sock, gr.carry.len())
    };
    let space = GRBUFLEN - carry_len;
    let want = if rmax == 0 {
        space
    } else {
        space.min(rmax as usize)
    };
    let nread = match sock_read(&sock, &mut buf[carry_len..carry_len + want]) {
        SockRead::Data(n) => n as u64,
        SockRead::Blocked => {
            // carry stays in the reader for the next tick
            sw.arm_read(h);
            return 0;
        }
        SockRead::Eof => {
            on_read_eof(sw, policy, h);
            return 0;
        }
        SockRead::Failed(e) => {
            peer_kill(sw, policy, h, Error::Read(e));
            return 0;
        }
    };
    if carry_len > 0
        && let Some(p) = sw.peers.get_mut(&h)
        && let Reader::Generic(gr) = &mut p.reader
    {
        gr.carry.clear();
    }

    let Some(bf_len) = sw
        .peers
        .get(&h)
        .and_then(|p| p.tp)
        .and_then(|tid| sw.torrents.get(&tid))
        .map(|t| t.lengths().piece_bitfield_bytes())
    else {
        return nread;
    };

    let len = carry_len + nread as usize;
    let mut off = 0usize;

    while len - off >= 4 {
        let msg_len = BE::read_u32(&buf[off..off + 4]) as usize;
        if msg_len == 0 {
            trace!(peer = h, "keep alive");
            off += 4;
            continue;
        }
        if len - off < 5 {
            break;
        }
        let msg_id = buf[off + 4];

        // the advertised length is checked before waiting for the body
        let len_ok = match msg_id {
            MSGID_CHOKE | MSGID_UNCHOKE | MSGID_INTERESTED | MSGID_NOT_INTERESTED => msg_len == 1,
            MSGID_HAVE => msg_len == 5,
            MSGID_BITFIELD => msg_len == bf_len + 1,
            MSGID_REQUEST | MSGID_CANCEL => msg_len == 13,
            MSGID_PIECE => msg_len >= 10,
            _ => false,
        };
        if !len_ok {
            peer_kill(sw, policy, h, Error::BadData("bad message"));
            return nread;
        }
        if msg_id == MSGID_BITFIELD
            && sw.peers.get(&h).map(|p| p.npieces != 0).unwrap_or(false)
        {
            peer_kill(
                sw,
                policy,
                h,
                Error::BadData("bitfield after piece announcements"),
            );
            return nread;
        }

        let frame_len = 4 + msg_len;
        if len - off < frame_len {
            // frame won't fit in this tick's buffer
            match msg_id {
                MSGID_BITFIELD => {
                    let seed = &buf[off + 5..len];
                    if let Some(p) = sw.peers.get_mut(&h) {
                        p.reader = Reader::bitfield(msg_len - 1, seed);
                    }
                    sw.arm_read(h);
                    return nread;
                }
                MSGID_PIECE => {
                    if len - off < 13 {
                        break;
                    }
                    let index = BE::read_u32(&buf[off + 5..off + 9]);
                    let begin = BE::read_u32(&buf[off + 9..off + 13]);
                    let length = (msg_len - 9) as u32;
                    let seed = &buf[off + 13..len];
                    let slot = sw.bw.slot();
                    let Some(p) = sw.peers.get_mut(&h) else {
                        return nread;
                    };
                    p.rate_to_me[slot] += seed.len() as u64;
                    let tid = p.tp;
                    p.reader = Reader::piece(index, begin, length, seed);
                    if let Some(t) = tid.and_then(|tid| sw.torrents.get_mut(&tid)) {
                        t.downloaded += seed.len() as u64;
                    }
                    sw.arm_read(h);
                    return nread;
                }
                _ => break,
            }
        }

        let m = match Message::deserialize(&buf[off..off + frame_len]) {
            Ok((m, consumed)) => {
                debug_assert_eq!(consumed, frame_len);
                m
            }
            Err(e) => {
                peer_kill(sw, policy, h, Error::Deserialize(e));
                return nread;
            }
        };
        off += frame_len;
        msg::handle_message(sw, store, policy, h, m);
        if !sw.peer_alive(h) {
            return nread;
        }
    }

    if off != len
        && let Some(p) = sw.peers.get_mut(&h)
        && let Reader::Generic(gr) = &mut p.reader
    {
        gr.carry
            .try_extend_from_slice(&buf[off..len])
            .expect("partial frame header exceeds carry buffer");
    }
    sw.arm_read(h);
    nread
}

fn bitfield_read<P: PolicyCallbacks>(
    sw: &mut Swarm,
    policy: &mut P,
    h: PeerHandle,
    rmax: u64,
) -> u64 {
    let r = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return 0;
        };
        let sock = p.sock.clone();
        let Reader::Bitfield(rd) = &mut p.reader else {
            return 0;
        };
        let space = rd.buf.len() - rd.off;
        let want = if rmax == 0 {
            space
        } else {
            space.min(rmax as usize)
        };
        match sock_read(&sock, &mut rd.buf[rd.off..rd.off + want]) {
            SockRead::Data(n) => {
                rd.off += n;
                SockRead::Data(n)
            }
            other => other,
        }
    };
    let nread = match r {
        SockRead::Data(n) => n as u64,
        SockRead::Blocked => {
            sw.arm_read(h);
            return 0;
        }
        SockRead::Eof => {
            on_read_eof(sw, policy, h);
            return 0;
        }
        SockRead::Failed(e) => {
            peer_kill(sw, policy, h, Error::Read(e));
            return 0;
        }
    };

    let complete = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return nread;
        };
        match &p.reader {
            Reader::Bitfield(rd) => rd.off == rd.buf.len(),
            _ => return nread,
        }
    };
    if complete {
        let bytes = {
            let Some(p) = sw.peers.get_mut(&h) else {
                return nread;
            };
            match std::mem::replace(&mut p.reader, Reader::generic()) {
                Reader::Bitfield(rd) => rd.buf,
                _ => return nread,
            }
        };
        msg::install_bitfield(sw, policy, h, &bytes);
    }
    sw.arm_read(h);
    nread
}

fn piece_read<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    rmax: u64,
) -> u64 {
    let slot = sw.bw.slot();
    let r = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return 0;
        };
        let sock = p.sock.clone();
        let Reader::Piece(rd) = &mut p.reader else {
            return 0;
        };
        let space = rd.buf.len() - rd.off;
        let want = if rmax == 0 {
            space
        } else {
            space.min(rmax as usize)
        };
        match sock_read(&sock, &mut rd.buf[rd.off..rd.off + want]) {
            SockRead::Data(n) => {
                rd.off += n;
                p.rate_to_me[slot] += n as u64;
                SockRead::Data(n)
            }
            other => other,
        }
    };
    let nread = match r {
        SockRead::Data(n) => n as u64,
        SockRead::Blocked => {
            sw.arm_read(h);
            return 0;
        }
        SockRead::Eof => {
            on_read_eof(sw, policy, h);
            return 0;
        }
        SockRead::Failed(e) => {
            peer_kill(sw, policy, h, Error::Read(e));
            return 0;
        }
    };

    let (tid, complete) = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return nread;
        };
        let complete = match &p.reader {
            Reader::Piece(rd) => rd.off == rd.buf.len(),
            _ => return nread,
        };
        (p.tp, complete)
    };
    if let Some(t) = tid.and_then(|tid| sw.torrents.get_mut(&tid)) {
        t.downloaded += nread;
    }
    if complete {
        let rd = {
            let Some(p) = sw.peers.get_mut(&h) else {
                return nread;
            };
            match std::mem::replace(&mut p.reader, Reader::generic()) {
                Reader::Piece(rd) => rd,
                _ => return nread,
            }
        };
        commit_piece(sw, store, policy, h, rd.index, rd.begin, &rd.buf);
    }
    sw.arm_read(h);
    nread
}

/// Store a fully reassembled block, provided our oldest outstanding
/// request still matches it exactly.
fn commit_piece<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    index: u32,
    begin: u32,
    block: &[u8],
) {
    use weir_peer_protocol::Request;
    let Some(p) = sw.peers.get_mut(&h) else {
        return;
    };
    let Some(tid) = p.tp else {
        return;
    };
    let matched = p.my_reqs.front() == Some(&Request::new(index, begin, block.len() as u32));
    if !matched {
        trace!(peer = h, index, begin, "dropping unrequested block");
        return;
    }
    p.my_reqs.pop_front();
    let Some(piece_length) = sw
        .torrents
        .get(&tid)
        .map(|t| t.lengths().default_piece_length() as u64)
    else {
        return;
    };
    let cbegin = index as u64 * piece_length + begin as u64;
    store.put_bytes(tid, cbegin, block);
    policy.on_block(sw, h);
}

/// Drain up to `wmax` bytes (0 = unlimited) of the peer's send queue
/// with one vectored write. Returns the bytes the socket accepted.
pub(crate) fn net_write<P: PolicyCallbacks>(
    sw: &mut Swarm,
    policy: &mut P,
    h: PeerHandle,
    wmax: u64,
) -> u64 {
    let slot = sw.bw.slot();
    let res = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return 0;
        };
        if p.outq.is_empty() {
            return 0;
        }
        let sock = p.sock.clone();
        let iovs = p.outq.fill_iovecs(wmax);
        loop {
            match sock.try_write_vectored(&iovs) {
                Ok(n) => break Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Err(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Some(e)),
            }
        }
    };
    let n = match res {
        Ok(n) => n as u64,
        Err(None) => {
            sw.arm_write(h);
            return 0;
        }
        Err(Some(e)) => {
            peer_kill(sw, policy, h, Error::Write(e));
            return 0;
        }
    };

    let (uploaded, tid, queue_empty, write_close) = {
        let Some(p) = sw.peers.get_mut(&h) else {
            return 0;
        };
        p.rate_from_me[slot] += n;
        let uploaded = p.outq.apportion(n, &mut p.p_reqs);
        (uploaded, p.tp, p.outq.is_empty(), p.flags.write_close)
    };
    if uploaded > 0
        && let Some(t) = tid.and_then(|tid| sw.torrents.get_mut(&tid))
    {
        t.uploaded += uploaded;
    }
    if !queue_empty {
        sw.arm_write(h);
    } else if write_close {
        peer_kill(sw, policy, h, Error::WriteClose);
    }
    n
}

/// Readable readiness: read now if inbound budget allows, otherwise
/// park on the read queue until the next refill.
pub(crate) fn on_readable<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
) {
    if sw.bw.ibwlim == 0 {
        peer_read(sw, store, policy, h, 0);
    } else if sw.bw.ibw_left > 0 {
        let n = peer_read(sw, store, policy, h, sw.bw.ibw_left);
        sw.bw.ibw_left = sw.bw.ibw_left.saturating_sub(n);
    } else if let Some(p) = sw.peers.get_mut(&h)
        && !p.flags.on_readq
    {
        p.flags.on_readq = true;
        sw.bw.readq.push_back(h);
    }
}

/// Writable readiness, symmetric to [`on_readable`].
pub(crate) fn on_writable<P: PolicyCallbacks>(sw: &mut Swarm, policy: &mut P, h: PeerHandle) {
    // the queue may have been unsent since the event was armed
    if sw
        .peers
        .get(&h)
        .map(|p| p.outq.is_empty())
        .unwrap_or(true)
    {
        return;
    }
    if sw.bw.obwlim == 0 {
        net_write(sw, policy, h, 0);
    } else if sw.bw.obw_left > 0 {
        let n = net_write(sw, policy, h, sw.bw.obw_left);
        sw.bw.obw_left = sw.bw.obw_left.saturating_sub(n);
    } else if let Some(p) = sw.peers.get_mut(&h)
        && !p.flags.on_writeq
    {
        p.flags.on_writeq = true;
        sw.bw.writeq.push_back(h);
    }
}

/// The once-per-second heartbeat: zero the new rate-history slot,
/// refill both buckets, then drain the parked peers in FIFO order while
/// budget lasts.
pub(crate) fn heartbeat<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
) {
    sw.bw.tick();
    let slot = sw.bw.slot();
    for p in sw.peers.values_mut() {
        p.rate_to_me[slot] = 0;
        p.rate_from_me[slot] = 0;
    }

    if sw.bw.ibwlim > 0 {
        while sw.bw.ibw_left > 0 {
            let Some(h) = sw.bw.readq.pop_front() else {
                break;
            };
            if let Some(p) = sw.peers.get_mut(&h) {
                p.flags.on_readq = false;
            }
            let n = peer_read(sw, store, policy, h, sw.bw.ibw_left);
            sw.bw.ibw_left = sw.bw.ibw_left.saturating_sub(n);
        }
    } else {
        while let Some(h) = sw.bw.readq.pop_front() {
            if let Some(p) = sw.peers.get_mut(&h) {
                p.flags.on_readq = false;
            }
            peer_read(sw, store, policy, h, 0);
        }
    }

    if sw.bw.obwlim > 0 {
        while sw.bw.obw_left > 0 {
            let Some(h) = sw.bw.writeq.pop_front() else {
                break;
            };
            if let Some(p) = sw.peers.get_mut(&h) {
                p.flags.on_writeq = false;
            }
            let n = net_write(sw, policy, h, sw.bw.obw_left);
            sw.bw.obw_left = sw.bw.obw_left.saturating_sub(n);
        }
    } else {
        while let Some(h) = sw.bw.writeq.pop_front() {
            if let Some(p) = sw.peers.get_mut(&h) {
                p.flags.on_writeq = false;
            }
            net_write(sw, policy, h, 0);
        }
    }
}
