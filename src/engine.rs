//! The engine: the session manager owning every torrent task.
//!
//! The engine task maintains the info-hash to session table (at most one
//! live session per info-hash), relays lifecycle operations, hosts the
//! shared TCP listener that routes inbound handshakes to the right session,
//! and owns the global bandwidth buckets every session draws from.
//!
//! The [`Engine`] handle is a thin, cloneable command channel; all state
//! lives in the task. Consumers read a single event stream on which every
//! session reports, each event tagged with its info-hash.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    conf::{Conf, TorrentConf},
    descriptor::TorrentDescriptor,
    discovery::PeerSource,
    error::*,
    event::{EventReceiver, EventSender, TorrentStats},
    peer::codec::{Handshake, HandshakeCodec},
    rate::{self, SharedBucket},
    storage::{Checkpoint, CheckpointSink, Storage},
    torrent::{self, Status, TorrentCommand, TorrentCommandSender},
    InfoHash,
};

/// How long an inbound connection gets to produce its handshake before the
/// socket is dropped.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long engine shutdown waits for each session to stop cleanly.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What a torrent is added with. The collaborators are per-torrent so
/// embedders can mix storage backends within one engine.
pub struct AddTorrentOptions {
    pub descriptor: TorrentDescriptor,
    pub storage: Arc<dyn Storage>,
    pub checkpoints: Arc<dyn CheckpointSink>,
    pub peer_source: Arc<dyn PeerSource>,
    /// Overrides the engine-wide torrent defaults when set.
    pub conf: Option<TorrentConf>,
    /// Resume state from a previous run; its bitfield is re-verified
    /// against storage before the session serves anything.
    pub resume: Option<Checkpoint>,
    /// Leave the torrent stopped instead of starting it right away.
    pub add_stopped: bool,
}

/// A snapshot row of [`Engine::list`].
#[derive(Clone, Debug)]
pub struct TorrentSummary {
    pub info_hash: InfoHash,
    pub status: Status,
    pub stats: TorrentStats,
}

/// The cloneable handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    cmd_tx: UnboundedSender<EngineCommand>,
    listen_addr: Option<SocketAddr>,
}

impl Engine {
    /// Starts the engine and, when configured, its peer listener. Returns
    /// the handle and the event stream.
    pub async fn spawn(conf: Conf) -> Result<(Self, EventReceiver)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut listen_addr = None;
        let listener_join = match conf.engine.listen_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| {
                    Error::Fatal(format!("cannot bind peer listener: {}", e))
                })?;
                // with port 0 the real port is only known after the bind
                listen_addr = listener.local_addr().ok();
                let cmd_tx = cmd_tx.clone();
                Some(tokio::spawn(listen(listener, cmd_tx)))
            }
            None => None,
        };

        let global_down = rate::shared(conf.engine.download_rate_limit);
        let global_up = rate::shared(conf.engine.upload_rate_limit);
        let mut task = EngineTask {
            conf,
            torrents: HashMap::new(),
            events: events_tx,
            global_down,
            global_up,
            cmd_rx,
            listener_join,
        };
        tokio::spawn(async move { task.run().await });

        Ok((
            Self {
                cmd_tx,
                listen_addr,
            },
            events_rx,
        ))
    }

    /// The address the peer listener is bound to, if one is running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Registers a torrent and (unless added stopped) starts it. Fails with
    /// [`Error::Duplicate`] when the info-hash is already managed.
    pub async fn add_torrent(
        &self,
        options: AddTorrentOptions,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(EngineCommand::AddTorrent {
            options: Box::new(options),
            reply,
        })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stops the session (flushing a final checkpoint) and forgets it.
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::RemoveTorrent { info_hash, reply })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn start(&self, info_hash: InfoHash) -> Result<()> {
        self.torrent_op(info_hash, TorrentOp::Start).await
    }

    pub async fn stop(&self, info_hash: InfoHash) -> Result<()> {
        self.torrent_op(info_hash, TorrentOp::Stop).await
    }

    pub async fn pause(&self, info_hash: InfoHash) -> Result<()> {
        self.torrent_op(info_hash, TorrentOp::Pause).await
    }

    pub async fn resume(&self, info_hash: InfoHash) -> Result<()> {
        self.torrent_op(info_hash, TorrentOp::Resume).await
    }

    /// Re-verifies every piece against storage; the only operation that may
    /// shrink a torrent's verified bitfield.
    pub async fn recheck(&self, info_hash: InfoHash) -> Result<()> {
        self.torrent_op(info_hash, TorrentOp::Recheck).await
    }

    async fn torrent_op(
        &self,
        info_hash: InfoHash,
        op: TorrentOp,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(EngineCommand::TorrentOp {
            info_hash,
            op,
            reply,
        })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// The status and statistics of one torrent.
    pub async fn stats(
        &self,
        info_hash: InfoHash,
    ) -> Result<(Status, TorrentStats)> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::QueryStats { info_hash, reply })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// A snapshot of every managed torrent.
    pub async fn list(&self) -> Result<Vec<TorrentSummary>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(EngineCommand::List { reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stops every session and the listener. The engine is unusable
    /// afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(EngineCommand::Shutdown { reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }
}

enum TorrentOp {
    Start,
    Stop,
    Pause,
    Resume,
    Recheck,
}

enum EngineCommand {
    AddTorrent {
        options: Box<AddTorrentOptions>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveTorrent {
        info_hash: InfoHash,
        reply: oneshot::Sender<Result<()>>,
    },
    TorrentOp {
        info_hash: InfoHash,
        op: TorrentOp,
        reply: oneshot::Sender<Result<()>>,
    },
    QueryStats {
        info_hash: InfoHash,
        reply: oneshot::Sender<Result<(Status, TorrentStats)>>,
    },
    List {
        reply: oneshot::Sender<Vec<TorrentSummary>>,
    },
    InboundPeer {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct TorrentEntry {
    cmd_tx: TorrentCommandSender,
    join: tokio::task::JoinHandle<()>,
}

struct EngineTask {
    conf: Conf,
    torrents: HashMap<InfoHash, TorrentEntry>,
    events: EventSender,
    global_down: SharedBucket,
    global_up: SharedBucket,
    cmd_rx: UnboundedReceiver<EngineCommand>,
    listener_join: Option<tokio::task::JoinHandle<()>>,
}

impl EngineTask {
    async fn run(&mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                EngineCommand::AddTorrent { options, reply } => {
                    let _ = reply.send(self.add_torrent(*options));
                }
                EngineCommand::RemoveTorrent { info_hash, reply } => {
                    let _ = reply.send(self.remove_torrent(info_hash).await);
                }
                EngineCommand::TorrentOp {
                    info_hash,
                    op,
                    reply,
                } => {
                    let _ = reply.send(self.torrent_op(info_hash, op));
                }
                EngineCommand::QueryStats { info_hash, reply } => {
                    match self.torrents.get(&info_hash) {
                        Some(entry) => {
                            let (stats_reply, stats_rx) = oneshot::channel();
                            let sent = entry
                                .cmd_tx
                                .send(TorrentCommand::QueryStats {
                                    reply: stats_reply,
                                })
                                .is_ok();
                            tokio::spawn(async move {
                                let result = if sent {
                                    stats_rx
                                        .await
                                        .map_err(|_| Error::Shutdown)
                                } else {
                                    Err(Error::Shutdown)
                                };
                                let _ = reply.send(result);
                            });
                        }
                        None => {
                            let _ = reply
                                .send(Err(Error::NotFound { info_hash }));
                        }
                    }
                }
                EngineCommand::List { reply } => {
                    self.list(reply);
                }
                EngineCommand::InboundPeer { socket, handshake } => {
                    match self.torrents.get(&handshake.info_hash) {
                        Some(entry) => {
                            let _ = entry.cmd_tx.send(
                                TorrentCommand::InboundPeer {
                                    socket,
                                    handshake,
                                },
                            );
                        }
                        None => {
                            log::debug!(
                                "inbound peer for unknown torrent {}",
                                hex::encode(handshake.info_hash)
                            );
                        }
                    }
                }
                EngineCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn add_torrent(&mut self, options: AddTorrentOptions) -> Result<()> {
        let info_hash = options.descriptor.info_hash;
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::Duplicate { info_hash });
        }
        options.descriptor.validate()?;

        log::info!("adding torrent {}", hex::encode(info_hash));
        let params = torrent::TorrentParams {
            descriptor: Arc::new(options.descriptor),
            conf: options
                .conf
                .unwrap_or_else(|| self.conf.torrent.clone()),
            client_id: self.conf.engine.client_id,
            storage: options.storage,
            checkpoints: options.checkpoints,
            peer_source: options.peer_source,
            events: self.events.clone(),
            global_down: Arc::clone(&self.global_down),
            global_up: Arc::clone(&self.global_up),
            resume: options.resume,
        };
        let (cmd_tx, join) = torrent::spawn(params);
        if !options.add_stopped {
            let _ = cmd_tx.send(TorrentCommand::Start);
        }
        self.torrents.insert(info_hash, TorrentEntry { cmd_tx, join });
        Ok(())
    }

    async fn remove_torrent(&mut self, info_hash: InfoHash) -> Result<()> {
        let entry = self
            .torrents
            .remove(&info_hash)
            .ok_or(Error::NotFound { info_hash })?;
        log::info!("removing torrent {}", hex::encode(info_hash));
        Self::shutdown_session(info_hash, entry).await;
        Ok(())
    }

    fn torrent_op(
        &mut self,
        info_hash: InfoHash,
        op: TorrentOp,
    ) -> Result<()> {
        let entry = self
            .torrents
            .get(&info_hash)
            .ok_or(Error::NotFound { info_hash })?;
        let cmd = match op {
            TorrentOp::Start => TorrentCommand::Start,
            TorrentOp::Stop => TorrentCommand::Stop,
            TorrentOp::Pause => TorrentCommand::Pause,
            TorrentOp::Resume => TorrentCommand::Resume,
            TorrentOp::Recheck => TorrentCommand::Recheck,
        };
        entry.cmd_tx.send(cmd).map_err(|_| Error::Shutdown)
    }

    fn list(&self, reply: oneshot::Sender<Vec<TorrentSummary>>) {
        let queries: Vec<(InfoHash, oneshot::Receiver<(Status, TorrentStats)>)> =
            self.torrents
                .iter()
                .filter_map(|(info_hash, entry)| {
                    let (stats_reply, stats_rx) = oneshot::channel();
                    entry
                        .cmd_tx
                        .send(TorrentCommand::QueryStats { reply: stats_reply })
                        .ok()
                        .map(|_| (*info_hash, stats_rx))
                })
                .collect();
        // collect the replies off the engine task so a slow session can't
        // stall unrelated commands
        tokio::spawn(async move {
            let mut summaries = Vec::with_capacity(queries.len());
            for (info_hash, stats_rx) in queries {
                if let Ok((status, stats)) = stats_rx.await {
                    summaries.push(TorrentSummary {
                        info_hash,
                        status,
                        stats,
                    });
                }
            }
            let _ = reply.send(summaries);
        });
    }

    async fn shutdown(&mut self) {
        if let Some(listener) = self.listener_join.take() {
            listener.abort();
        }
        for (info_hash, entry) in std::mem::take(&mut self.torrents) {
            Self::shutdown_session(info_hash, entry).await;
        }
    }

    async fn shutdown_session(info_hash: InfoHash, entry: TorrentEntry) {
        let (reply, rx) = oneshot::channel();
        if entry
            .cmd_tx
            .send(TorrentCommand::Shutdown { reply })
            .is_ok()
        {
            if timeout(SHUTDOWN_TIMEOUT, rx).await.is_err() {
                log::warn!(
                    "torrent {} did not stop in time, aborting",
                    hex::encode(info_hash)
                );
                entry.join.abort();
            }
        }
    }
}

/// Accepts inbound connections and reads their handshake, then hands them
/// to the engine for routing by info-hash. Unknown or silent peers are
/// simply dropped.
async fn listen(
    listener: TcpListener,
    cmd_tx: UnboundedSender<EngineCommand>,
) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        log::debug!("inbound connection from {}", addr);
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let mut socket = Framed::new(socket, HandshakeCodec);
            match timeout(INBOUND_HANDSHAKE_TIMEOUT, socket.next()).await {
                Ok(Some(Ok(handshake))) => {
                    let _ = cmd_tx
                        .send(EngineCommand::InboundPeer { socket, handshake });
                }
                Ok(Some(Err(e))) => {
                    log::debug!("inbound peer {} handshake error: {}", addr, e);
                }
                Ok(None) | Err(_) => {
                    log::debug!("inbound peer {} sent no handshake", addr);
                }
            }
        });
    }
}
