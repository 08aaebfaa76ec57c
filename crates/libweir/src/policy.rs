use crate::swarm::Swarm;
use crate::type_aliases::PeerHandle;

/// Peer-selection policy hooks, invoked by the engine on protocol
/// events. Choking, optimistic unchoke and request scheduling live
/// behind this trait; the engine only reports transitions and carries
/// out whatever the policy tells the [`Swarm`] to send.
///
/// All methods default to doing nothing, and `()` implements the trait,
/// so a pure observer (or a test) can opt into just the events it cares
/// about.
pub trait PolicyCallbacks: Send + 'static {
    /// A peer finished its handshake and is ready to talk.
    fn on_new_peer(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }

    /// A peer connection was destroyed. Only fires for peers that
    /// completed their handshake (pairs with `on_new_peer`).
    fn on_lost_peer(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }

    /// The peer announced a piece, via HAVE or one bit of its BITFIELD.
    fn on_piece_ann(&mut self, sw: &mut Swarm, p: PeerHandle, index: u32) {
        let _ = (sw, p, index);
    }

    /// A requested block arrived and was written to the store.
    fn on_block(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }

    /// The peer became interested while we weren't choking it.
    fn on_upload(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }

    /// The peer lost interest while we weren't choking it.
    fn on_unupload(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }

    /// The peer unchoked us while we were interested.
    fn on_download(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }

    /// The peer choked us while we were interested and unchoked.
    fn on_undownload(&mut self, sw: &mut Swarm, p: PeerHandle) {
        let _ = (sw, p);
    }
}

impl PolicyCallbacks for () {}
