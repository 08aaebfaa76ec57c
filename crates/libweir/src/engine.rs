use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};
use weir_core::Id20;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net;
use crate::policy::PolicyCallbacks;
use crate::reader::Reader;
use crate::store::TorrentStore;
use crate::swarm::{Dial, Swarm};
use crate::torrent::TorrentMeta;
use crate::type_aliases::{BF, PeerHandle, TorrentId};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TorrentStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub num_peers: usize,
}

pub(crate) enum Command {
    Connect {
        torrent: TorrentId,
        addr: SocketAddr,
        peer_id: Id20,
    },
    Stats {
        torrent: TorrentId,
        tx: oneshot::Sender<Option<TorrentStats>>,
    },
    Shutdown,
}

/// Cheap cloneable handle for talking to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Dial a peer of `torrent` whose peer id we expect (e.g. from a
    /// tracker response).
    pub fn connect(&self, torrent: TorrentId, addr: SocketAddr, peer_id: Id20) -> Result<()> {
        self.tx
            .send(Command::Connect {
                torrent,
                addr,
                peer_id,
            })
            .map_err(|_| Error::EngineDead)
    }

    pub async fn stats(&self, torrent: TorrentId) -> Result<TorrentStats> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { torrent, tx })
            .map_err(|_| Error::EngineDead)?;
        rx.await
            .map_err(|_| Error::EngineDead)?
            .ok_or(Error::TorrentNotFound)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

type ReadyFut = Pin<Box<dyn Future<Output = (PeerHandle, Interest, io::Result<()>)> + Send>>;
type DialFut = Pin<Box<dyn Future<Output = (Dial, io::Result<TcpStream>)> + Send>>;

/// The engine: one cooperative task owning every peer connection, the
/// torrent registry and the bandwidth scheduler. Readiness events, the
/// accept loop, outbound dials, commands and the one-second heartbeat
/// all multiplex through [`Engine::run`].
pub struct Engine<S, P> {
    config: Config,
    swarm: Swarm,
    store: S,
    policy: P,
    listener: Option<TcpListener>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl<S: TorrentStore, P: PolicyCallbacks> Engine<S, P> {
    pub fn new(config: Config, store: S, policy: P) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            swarm: Swarm::new(&config),
            config,
            store,
            policy,
            listener: None,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Register a torrent the store can serve. `piece_field` is the
    /// locally owned pieces, one bit per piece; None means none owned.
    pub fn add_torrent(
        &mut self,
        meta: TorrentMeta,
        piece_field: Option<BF>,
    ) -> anyhow::Result<TorrentId> {
        if let Some(f) = &piece_field
            && f.len() != meta.lengths.total_pieces() as usize
        {
            anyhow::bail!(
                "piece field has {} bits, torrent has {} pieces",
                f.len(),
                meta.lengths.total_pieces()
            );
        }
        Ok(self.swarm.add_torrent(meta, piece_field))
    }

    /// Queue an outbound connection before the engine starts.
    pub fn connect(&mut self, torrent: TorrentId, addr: SocketAddr, peer_id: Id20) -> Result<()> {
        self.swarm.connect(torrent, addr, peer_id)
    }

    /// Open the listening socket now and report the bound address.
    /// Useful with an ephemeral port; `run` binds implicitly otherwise.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = self.config.listen_addr.ok_or_else(|| {
            Error::Listen(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listen_addr configured",
            ))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(Error::Listen)?;
        let local = listener.local_addr().map_err(Error::Listen)?;
        info!("listening on {local} for incoming peer connections");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Drive the engine until shutdown is requested.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if self.listener.is_none() && self.config.listen_addr.is_some() {
            self.bind().await?;
        }
        let listener = self.listener.take();
        let mut cmd_rx = self.cmd_rx.take().ok_or(Error::EngineDead)?;

        let mut tick = tokio::time::interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let mut ready: FuturesUnordered<ReadyFut> = FuturesUnordered::new();
        let mut dials: FuturesUnordered<DialFut> = FuturesUnordered::new();

        loop {
            self.flush(&mut ready, &mut dials);
            tokio::select! {
                biased;
                _ = tick.tick() => {
                    net::heartbeat(&mut self.swarm, &self.store, &mut self.policy);
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Connect { torrent, addr, peer_id }) => {
                        if let Err(e) = self.swarm.connect(torrent, addr, peer_id) {
                            debug!(%addr, "dial rejected: {e:#}");
                        }
                    }
                    Some(Command::Stats { torrent, tx }) => {
                        let _ = tx.send(self.torrent_stats(torrent));
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some((h, interest, res)) = ready.next(), if !ready.is_empty() => {
                    self.on_ready(h, interest, res);
                }
                Some((dial, res)) = dials.next(), if !dials.is_empty() => {
                    self.on_dial(dial, res);
                }
                res = accept_one(&listener), if listener.is_some() => {
                    self.on_accept(res);
                }
            }
        }

        let handles: Vec<PeerHandle> = self.swarm.peers.keys().copied().collect();
        for h in handles {
            net::peer_kill(&mut self.swarm, &mut self.policy, h, Error::Disconnect);
        }
        Ok(())
    }

    fn torrent_stats(&self, torrent: TorrentId) -> Option<TorrentStats> {
        self.swarm.torrent(torrent).map(|t| TorrentStats {
            uploaded: t.uploaded(),
            downloaded: t.downloaded(),
            num_peers: t.peers().len(),
        })
    }

    /// Turn the work queued during the last dispatch into futures: one
    /// one-shot readiness wait per armed direction, one connect future
    /// per queued dial, and bury whatever the policy disconnected.
    fn flush(&mut self, ready: &mut FuturesUnordered<ReadyFut>, dials: &mut FuturesUnordered<DialFut>) {
        while let Some(h) = self.swarm.killq.pop() {
            net::peer_kill(&mut self.swarm, &mut self.policy, h, Error::Disconnect);
        }
        for (h, interest) in self.swarm.armq.drain(..) {
            let Some(p) = self.swarm.peers.get(&h) else {
                continue;
            };
            let sock = p.sock.clone();
            ready.push(Box::pin(async move {
                let res = sock.ready(interest).await.map(|_| ());
                (h, interest, res)
            }));
        }
        for dial in self.swarm.dialq.drain(..) {
            dials.push(Box::pin(async move {
                let res = TcpStream::connect(dial.addr).await;
                (dial, res)
            }));
        }
    }

    fn on_ready(&mut self, h: PeerHandle, interest: Interest, res: io::Result<()>) {
        let Some(p) = self.swarm.peers.get_mut(&h) else {
            return;
        };
        if interest.is_readable() {
            p.read_armed = false;
        } else {
            p.write_armed = false;
        }
        if p.closing {
            return;
        }
        if let Err(e) = res {
            let reason = if interest.is_readable() {
                Error::Read(e)
            } else {
                Error::Write(e)
            };
            net::peer_kill(&mut self.swarm, &mut self.policy, h, reason);
            return;
        }
        if interest.is_readable() {
            net::on_readable(&mut self.swarm, &self.store, &mut self.policy, h);
        } else {
            net::on_writable(&mut self.swarm, &mut self.policy, h);
        }
    }

    fn on_accept(&mut self, res: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, addr) = match res {
            Ok(v) => v,
            Err(e) => {
                debug!("accept error: {e:#}");
                return;
            }
        };
        if self.swarm.npeers >= self.swarm.max_peers {
            debug!(%addr, "rejecting connection, peer limit reached");
            return;
        }
        self.swarm.npeers += 1;
        let h = self
            .swarm
            .add_peer(addr, Arc::new(stream), true, Reader::handshake(true));
        debug!(peer = h, %addr, "got connection");
        self.swarm.arm_read(h);
    }

    fn on_dial(&mut self, dial: Dial, res: io::Result<TcpStream>) {
        let stream = match res {
            Ok(s) => s,
            Err(e) => {
                debug!(addr = %dial.addr, "botched connection: {e:#}");
                self.swarm.npeers -= 1;
                return;
            }
        };
        let h = self
            .swarm
            .add_peer(dial.addr, Arc::new(stream), false, Reader::handshake(false));
        if let Some(p) = self.swarm.peers.get_mut(&h) {
            p.tp = Some(dial.torrent);
            p.id = dial.peer_id;
        }
        debug!(peer = h, addr = %dial.addr, "connected");
        self.swarm.send_handshake(h);
        self.swarm.arm_read(h);
    }
}

async fn accept_one(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}
