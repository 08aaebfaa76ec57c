use weir_core::{Id20, Lengths};

use crate::type_aliases::{BF, PeerHandle};

/// The engine's view of a torrent's metainfo. How it was obtained is
/// the caller's business.
#[derive(Debug, Clone, Copy)]
pub struct TorrentMeta {
    pub info_hash: Id20,
    pub lengths: Lengths,
}

/// A torrent registered with the engine: metainfo view, local piece
/// ownership, transfer counters and the peers bound to it.
pub struct Torrent {
    meta: TorrentMeta,
    piece_field: BF,
    have_npieces: u32,
    pub(crate) uploaded: u64,
    pub(crate) downloaded: u64,
    pub(crate) peers: Vec<PeerHandle>,
}

impl Torrent {
    pub(crate) fn new(meta: TorrentMeta, piece_field: BF) -> Self {
        debug_assert_eq!(piece_field.len(), meta.lengths.total_pieces() as usize);
        let have_npieces = piece_field.count_ones() as u32;
        Self {
            meta,
            piece_field,
            have_npieces,
            uploaded: 0,
            downloaded: 0,
            peers: Vec::new(),
        }
    }

    pub fn info_hash(&self) -> &Id20 {
        &self.meta.info_hash
    }

    pub fn lengths(&self) -> &Lengths {
        &self.meta.lengths
    }

    pub fn piece_field(&self) -> &BF {
        &self.piece_field
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.piece_field
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// How many pieces we own locally.
    pub fn have_npieces(&self) -> u32 {
        self.have_npieces
    }

    /// Mark a piece as locally owned, e.g. after the store verified its
    /// hash. The engine itself never sets bits here.
    pub fn set_have_piece(&mut self, index: u32) {
        if let Some(mut bit) = self.piece_field.get_mut(index as usize)
            && !*bit
        {
            *bit = true;
            self.have_npieces += 1;
        }
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn peers(&self) -> &[PeerHandle] {
        &self.peers
    }
}
