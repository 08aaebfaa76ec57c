use std::collections::VecDeque;
use std::io::IoSlice;

use arrayvec::ArrayVec;
use bytes::Bytes;

/// Largest payload stored inline in a queue entry (the handshake).
pub(crate) const INLINE_BUF_LEN: usize = 68;

/// Max buffers gathered into one vectored write.
pub(crate) const NIOV: usize = 16;

/// Ownership of an outbound byte region.
pub(crate) enum IoBufKind {
    /// Small fixed-size message, copied into the entry.
    Inline(ArrayVec<u8, INLINE_BUF_LEN>),
    /// Heap payload owned by the queue (bitfield snapshots).
    Owned(Box<[u8]>),
    /// Piece data whose lifetime the store manages; dropping the handle
    /// is the only cleanup.
    Borrowed(Bytes),
}

impl IoBufKind {
    fn as_slice(&self) -> &[u8] {
        match self {
            IoBufKind::Inline(v) => v,
            IoBufKind::Owned(b) => b,
            IoBufKind::Borrowed(b) => b,
        }
    }
}

pub(crate) struct IoBuf {
    kind: IoBufKind,
    off: usize,
}

impl IoBuf {
    pub fn inline(data: &[u8]) -> Self {
        debug_assert!(!data.is_empty());
        let mut v = ArrayVec::new();
        v.try_extend_from_slice(data).expect("inline buf too large");
        Self {
            kind: IoBufKind::Inline(v),
            off: 0,
        }
    }

    pub fn owned(data: Box<[u8]>) -> Self {
        debug_assert!(!data.is_empty());
        Self {
            kind: IoBufKind::Owned(data),
            off: 0,
        }
    }

    pub fn borrowed(data: Bytes) -> Self {
        debug_assert!(!data.is_empty());
        Self {
            kind: IoBufKind::Borrowed(data),
            off: 0,
        }
    }

    fn total_len(&self) -> usize {
        self.kind.as_slice().len()
    }

    fn remaining(&self) -> &[u8] {
        &self.kind.as_slice()[self.off..]
    }
}

/// A piece the protocol handler promised to a peer but hasn't fully
/// written yet. `head_id` is the queue id of the 13-byte PIECE header;
/// the payload entry sits immediately behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PieceReq {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
    pub head_id: u64,
}

/// Ordered outbound byte regions for one peer. Entries get ids so piece
/// requests can refer to their header entry without pointers.
#[derive(Default)]
pub(crate) struct SendQueue {
    entries: VecDeque<(u64, IoBuf)>,
    next_id: u64,
}

impl SendQueue {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Total unwritten bytes.
    pub fn remaining_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, b)| b.remaining().len() as u64)
            .sum()
    }

    pub fn push(&mut self, buf: IoBuf) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back((id, buf));
        id
    }

    /// Gather up to NIOV iovecs from the head of the queue, truncating
    /// the last one so the total doesn't exceed `wmax` when `wmax > 0`.
    pub fn fill_iovecs(&self, wmax: u64) -> ArrayVec<IoSlice<'_>, NIOV> {
        let limited = wmax > 0;
        let mut left = wmax;
        let mut iovs = ArrayVec::new();
        for (_, buf) in self.entries.iter() {
            if iovs.is_full() || (limited && left == 0) {
                break;
            }
            let mut chunk = buf.remaining();
            if limited && chunk.len() as u64 > left {
                chunk = &chunk[..left as usize];
            }
            if limited {
                left -= chunk.len() as u64;
            }
            iovs.push(IoSlice::new(chunk));
        }
        iovs
    }

    /// Account `n` bytes accepted by the socket against the head of the
    /// queue. Fully consumed entries are popped (and their payloads
    /// dropped per ownership kind). Popping a piece header also pops the
    /// matching head of `p_reqs`; the returned sum of those payload
    /// lengths goes into the torrent's uploaded counter.
    pub fn apportion(&mut self, mut n: u64, p_reqs: &mut VecDeque<PieceReq>) -> u64 {
        let mut uploaded = 0u64;
        while n > 0 {
            let Some((id, buf)) = self.entries.front_mut() else {
                break;
            };
            let rem = buf.remaining().len() as u64;
            if n >= rem {
                n -= rem;
                let id = *id;
                self.entries.pop_front();
                if p_reqs.front().is_some_and(|r| r.head_id == id) {
                    p_reqs.pop_front();
                    uploaded += self
                        .entries
                        .front()
                        .map(|(_, b)| b.total_len() as u64)
                        .unwrap_or(0);
                }
            } else {
                buf.off += n as usize;
                n = 0;
            }
        }
        uploaded
    }

    /// Remove the entry with `head_id` and the entry immediately after
    /// it (a piece header and its payload). Returns false if the id is
    /// no longer queued.
    pub fn unsend(&mut self, head_id: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|(id, _)| *id == head_id) else {
            return false;
        };
        debug_assert!(pos + 1 < self.entries.len());
        self.entries.remove(pos + 1);
        self.entries.remove(pos);
        true
    }
}
