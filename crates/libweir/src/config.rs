use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use weir_core::{Id20, peer_id::generate_peer_id};

pub const DEFAULT_MAX_PEERS: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Address to accept peer connections on. None disables the listener.
    pub listen_addr: Option<SocketAddr>,

    /// Ceiling on concurrent peer connections, inbound and outbound
    /// combined.
    pub max_peers: usize,

    /// Inbound bandwidth cap in bytes per second. 0 means unlimited.
    pub download_bps: u64,

    /// Outbound bandwidth cap in bytes per second. 0 means unlimited.
    pub upload_bps: u64,

    /// Our peer id, sent in every handshake.
    pub peer_id: Id20,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_peers: DEFAULT_MAX_PEERS,
            download_bps: 0,
            upload_bps: 0,
            peer_id: generate_peer_id(),
        }
    }
}
