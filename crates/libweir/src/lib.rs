//!
//! A BitTorrent peer networking engine.
//!
//! This crate implements the per-connection wire protocol state machine,
//! the send/receive queues that feed it, and a global bandwidth scheduler
//! that rations socket reads and writes across all peers. Everything else
//! a full client needs is pluggable: piece storage and hashing live
//! behind [`TorrentStore`], peer-selection policy behind
//! [`PolicyCallbacks`].
//!
//! The engine runs as a single cooperative task. Create it, register
//! torrents, then drive it:
//!
//! ```no_run
//! use libweir::{Config, Engine, TorrentMeta};
//!
//! # async fn example(store: impl libweir::TorrentStore, meta: TorrentMeta) -> anyhow::Result<()> {
//! let config = Config {
//!     listen_addr: Some("0.0.0.0:6881".parse()?),
//!     ..Config::default()
//! };
//! let mut engine = Engine::new(config, store, ());
//! engine.add_torrent(meta, None)?;
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```

mod bandwidth;
mod config;
mod engine;
mod error;
mod msg;
mod net;
mod peer;
mod policy;
mod reader;
mod sendq;
mod store;
mod swarm;
mod torrent;
mod type_aliases;

pub use config::Config;
pub use engine::{Engine, EngineHandle, TorrentStats};
pub use error::{Error, Result};
pub use peer::PeerFlags;
pub use policy::PolicyCallbacks;
pub use store::TorrentStore;
pub use swarm::Swarm;
pub use torrent::{Torrent, TorrentMeta};
pub use type_aliases::{BF, PeerHandle, TorrentId};

pub use weir_core::{Id20, Lengths};
pub use weir_peer_protocol::Request;

#[cfg(test)]
mod tests;

/// The cargo version of libweir.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
