// Wire protocol semantics: what each decoded message does to the peer,
// the torrent and the policy layer. Framing and reassembly live in
// net.rs; by the time a message gets here it is complete.

use tracing::trace;
use weir_peer_protocol::{MAX_BLOCK_LEN, Message, Piece, Request};

use crate::error::Error;
use crate::net::peer_kill;
use crate::policy::PolicyCallbacks;
use crate::store::TorrentStore;
use crate::swarm::Swarm;
use crate::type_aliases::{BF, PeerHandle};

pub(crate) fn handle_message<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    m: Message<'_>,
) {
    match m {
        Message::KeepAlive => {}
        Message::Choke => {
            trace!(peer = h, "choke");
            let Some(p) = sw.peers.get_mut(&h) else {
                return;
            };
            let transition = !p.flags.p_choke && p.flags.i_want;
            p.flags.p_choke = true;
            if transition {
                policy.on_undownload(sw, h);
            }
        }
        Message::Unchoke => {
            trace!(peer = h, "unchoke");
            let Some(p) = sw.peers.get_mut(&h) else {
                return;
            };
            let transition = p.flags.p_choke && p.flags.i_want;
            p.flags.p_choke = false;
            if transition {
                policy.on_download(sw, h);
            }
        }
        Message::Interested => {
            trace!(peer = h, "interested");
            let Some(p) = sw.peers.get_mut(&h) else {
                return;
            };
            let transition = !p.flags.p_want && !p.flags.i_choke;
            p.flags.p_want = true;
            if transition {
                policy.on_upload(sw, h);
            }
        }
        Message::NotInterested => {
            trace!(peer = h, "not interested");
            let Some(p) = sw.peers.get_mut(&h) else {
                return;
            };
            let transition = p.flags.p_want && !p.flags.i_choke;
            p.flags.p_want = false;
            if transition {
                policy.on_unupload(sw, h);
            }
        }
        Message::Have(index) => handle_have(sw, policy, h, index),
        Message::Bitfield(bytes) => install_bitfield(sw, policy, h, bytes),
        Message::Request(r) => handle_request(sw, store, policy, h, r),
        Message::Piece(piece) => handle_piece(sw, store, policy, h, piece),
        Message::Cancel(r) => {
            trace!(peer = h, ?r, "cancel");
            sw.unsend_piece(h, r.index, r.begin, r.length);
        }
    }
}

fn handle_have<P: PolicyCallbacks>(sw: &mut Swarm, policy: &mut P, h: PeerHandle, index: u32) {
    trace!(peer = h, index, "have");
    let Some(npieces) = sw
        .peers
        .get(&h)
        .and_then(|p| p.tp)
        .and_then(|tid| sw.torrents.get(&tid))
        .map(|t| t.lengths().total_pieces())
    else {
        return;
    };
    if index >= npieces {
        peer_kill(sw, policy, h, Error::BadData("have index out of range"));
        return;
    }
    let Some(p) = sw.peers.get_mut(&h) else {
        return;
    };
    if !p.piece_field[index as usize] {
        p.piece_field.set(index as usize, true);
        p.npieces += 1;
        policy.on_piece_ann(sw, h, index);
    }
}

/// Install the remote's piece bitmap and announce every owned piece in
/// ascending order. Used both for an inline BITFIELD frame and for one
/// assembled across reads.
pub(crate) fn install_bitfield<P: PolicyCallbacks>(
    sw: &mut Swarm,
    policy: &mut P,
    h: PeerHandle,
    bytes: &[u8],
) {
    let Some(npieces) = sw
        .peers
        .get(&h)
        .and_then(|p| p.tp)
        .and_then(|tid| sw.torrents.get(&tid))
        .map(|t| t.lengths().total_pieces() as usize)
    else {
        return;
    };
    let mut bf = BF::from_slice(bytes);
    bf.truncate(npieces);
    let owned: Vec<u32> = bf.iter_ones().map(|i| i as u32).collect();
    trace!(peer = h, npieces = owned.len(), "bitfield");
    {
        let Some(p) = sw.peers.get_mut(&h) else {
            return;
        };
        p.npieces = owned.len() as u32;
        p.piece_field = bf;
    }
    for index in owned {
        policy.on_piece_ann(sw, h, index);
        if !sw.peer_alive(h) {
            return;
        }
    }
}

fn handle_request<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    r: Request,
) {
    trace!(peer = h, ?r, "request");
    let Some(p) = sw.peers.get(&h) else {
        return;
    };
    // silently ignored unless the peer is interested and unchoked by us
    if !(p.flags.p_want && !p.flags.i_choke) {
        return;
    }
    let Some(tid) = p.tp else {
        return;
    };
    let Some(t) = sw.torrents.get(&tid) else {
        return;
    };
    let lengths = *t.lengths();
    if r.length > MAX_BLOCK_LEN {
        peer_kill(sw, policy, h, Error::BadData("oversized request"));
        return;
    }
    let Some(index) = lengths.validate_piece_index(r.index) else {
        peer_kill(sw, policy, h, Error::BadData("request index out of range"));
        return;
    };
    if !t.has_piece(r.index) {
        peer_kill(sw, policy, h, Error::BadData("request for missing piece"));
        return;
    }
    if r.begin as u64 + r.length as u64 > lengths.default_piece_length() as u64 {
        peer_kill(sw, policy, h, Error::BadData("request beyond piece end"));
        return;
    }
    let cbegin = lengths.piece_offset(index) + r.begin as u64;
    if cbegin + r.length as u64 > lengths.total_length() {
        peer_kill(sw, policy, h, Error::BadData("request beyond torrent end"));
        return;
    }
    let block = store.get_bytes(tid, cbegin, r.length);
    debug_assert_eq!(block.len(), r.length as usize);
    sw.send_piece(h, r.index, r.begin, block);
}

/// A PIECE that arrived whole within one generic read tick. Counters
/// are bumped for any well-formed frame; the block is stored only when
/// it matches our oldest outstanding request.
fn handle_piece<S: TorrentStore, P: PolicyCallbacks>(
    sw: &mut Swarm,
    store: &S,
    policy: &mut P,
    h: PeerHandle,
    piece: Piece<'_>,
) {
    trace!(peer = h, ?piece, "piece");
    let length = piece.block.len() as u32;
    let slot = sw.bw.slot();
    let Some(p) = sw.peers.get_mut(&h) else {
        return;
    };
    let Some(tid) = p.tp else {
        return;
    };
    p.rate_to_me[slot] += length as u64;
    let matched = p.my_reqs.front() == Some(&Request::new(piece.index, piece.begin, length));
    if matched {
        p.my_reqs.pop_front();
    }
    let Some(t) = sw.torrents.get_mut(&tid) else {
        return;
    };
    t.downloaded += length as u64;
    if matched {
        let cbegin =
            piece.index as u64 * t.lengths().default_piece_length() as u64 + piece.begin as u64;
        store.put_bytes(tid, cbegin, piece.block);
        policy.on_block(sw, h);
    }
}
