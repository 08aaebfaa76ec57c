use bytes::Bytes;
use weir_core::Id20;

use crate::type_aliases::TorrentId;

/// The storage side of a torrent: piece bytes and info-hash resolution.
///
/// Metainfo parsing, hashing and disk layout are the implementor's
/// business; the engine only moves validated byte ranges. All offsets
/// are absolute within the torrent's concatenated content, and every
/// range is bounds-checked by the engine before it gets here. Storage
/// failures are not part of this contract: an implementation that can't
/// produce or persist bytes should treat that as fatal.
pub trait TorrentStore: Send + 'static {
    /// Resolve the info-hash from an incoming handshake to a torrent
    /// previously registered with the engine.
    fn get_by_hash(&self, info_hash: &Id20) -> Option<TorrentId>;

    /// Piece data for upload. The returned buffer sits in the send queue
    /// until fully written, so it must stay valid for the lifetime of
    /// the `Bytes` handle.
    fn get_bytes(&self, torrent: TorrentId, offset: u64, len: u32) -> Bytes;

    /// Write back a received block.
    fn put_bytes(&self, torrent: TorrentId, offset: u64, data: &[u8]);
}
