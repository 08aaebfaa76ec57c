use weir_peer_protocol::MessageDeserializeError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error binding listener: {0:#}")]
    Listen(#[source] std::io::Error),

    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),
    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),

    #[error("bad data: {0}")]
    BadData(&'static str),
    #[error("bad data: {0:#}")]
    Deserialize(
        #[from]
        #[source]
        MessageDeserializeError,
    ),
    #[error("bad handshake: {0}")]
    BadHandshake(&'static str),

    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("closed after outbound queue drained")]
    WriteClose,
    #[error("disconnect requested")]
    Disconnect,

    #[error("torrent not registered")]
    TorrentNotFound,

    #[error("peer limit reached")]
    MaxPeers,

    #[error("engine is dead")]
    EngineDead,
}

pub type Result<T> = core::result::Result<T, Error>;
