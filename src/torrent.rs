//! The per-torrent coordinator task.
//!
//! One task owns everything a torrent is: the peer table, the piece picker,
//! the in-flight piece downloads, the verified bitfield, the counters, and
//! the lifecycle status. Peer sessions, the verifier pool, and the engine
//! all talk to it through channels, so every mutation of that state is
//! serialized here; nothing in this module needs a lock.
//!
//! The task feeds on four sources: peer events, verifier verdicts, engine
//! commands, and a fixed heartbeat from which the slower clocks (choke
//! rounds, the optimistic rotation, peer top-up, autosave) are derived by
//! absolute deadlines.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use lru::LruCache;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{interval, timeout, Instant},
};
use tokio_util::codec::Framed;

use crate::{
    choke::{ChokeCandidate, Choker},
    conf::TorrentConf,
    counter::ThruputCounters,
    descriptor::TorrentDescriptor,
    discovery::PeerSource,
    download::{BlockReceipt, PieceDownload},
    error::*,
    event::{EventSender, TorrentEvent, TorrentStats},
    peer::{
        codec::{Handshake, HandshakeCodec},
        PeerCommand, PeerCommandSender, PeerEvent, PeerSession,
        PeerSessionArgs,
    },
    picker::PiecePicker,
    rate::{Limiter, SharedBucket},
    storage::{Checkpoint, CheckpointSink, Storage},
    verifier::{self, VerifyResult},
    Bitfield, BlockInfo, PeerId, PieceIndex, BLOCK_LEN,
};

/// The torrent task's heartbeat. The protocol clocks (1 s stats, 10 s
/// choke, ...) are measured against absolute deadlines on each beat, so a
/// delayed beat can't skew them.
const TICK: Duration = Duration::from_millis(250);

/// How long a stopping torrent waits for its peer tasks to flush and exit.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// The interval of the per-second bookkeeping (stats, EWMA rates, request
/// timeout scan).
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// A torrent's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Not running; connections closed.
    Stopped,
    /// Verifying resumed pieces against storage before trusting them.
    Checking,
    /// Incomplete and actively requesting.
    Downloading,
    /// Complete; uploading only.
    Seeding,
    /// Connections alive but no new requests are issued.
    Paused,
    /// A runtime invariant broke or storage failed fatally; the session
    /// refuses further work.
    Error,
}

/// What the engine asks of a torrent task.
pub(crate) enum TorrentCommand {
    Start,
    Pause,
    Resume,
    Stop,
    /// Re-verify every piece against storage. The only operation that may
    /// shrink the verified bitfield.
    Recheck,
    /// An accepted connection routed here by the engine listener.
    InboundPeer {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    QueryStats {
        reply: oneshot::Sender<(Status, TorrentStats)>,
    },
    /// Stop and exit the task. Used by remove and engine shutdown.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) type TorrentCommandSender = UnboundedSender<TorrentCommand>;

/// Everything needed to spawn a torrent task.
pub(crate) struct TorrentParams {
    pub descriptor: Arc<TorrentDescriptor>,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    pub storage: Arc<dyn Storage>,
    pub checkpoints: Arc<dyn CheckpointSink>,
    pub peer_source: Arc<dyn PeerSource>,
    pub events: EventSender,
    pub global_down: SharedBucket,
    pub global_up: SharedBucket,
    pub resume: Option<Checkpoint>,
}

/// Spawns the torrent task and returns its command channel and join handle.
pub(crate) fn spawn(
    params: TorrentParams,
) -> (TorrentCommandSender, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut torrent = Torrent::new(params, cmd_rx);
    let join = tokio::spawn(async move { torrent.run().await });
    (cmd_tx, join)
}

/// A connected (or connecting) peer as the torrent tracks it.
struct PeerHandle {
    cmd_tx: PeerCommandSender,
    join: tokio::task::JoinHandle<()>,
    /// False until the session's `Connected` event.
    connected: bool,
    /// True once a shutdown was sent; no further work is scheduled on the
    /// peer while its disconnect event is in flight.
    closing: bool,
    peer_id: Option<PeerId>,
    /// The extension bits the peer advertised in its handshake. Preserved
    /// for the daemon's DHT and extension layers, not interpreted here.
    reserved: [u8; 8],
    /// The peer's piece map. `None` until its bitfield or first have.
    pieces: Option<Bitfield>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    counters: ThruputCounters,
    /// Blocks we have requested from this peer and not yet received.
    outstanding: Vec<BlockInfo>,
    /// Consecutive request timeouts; resets on any delivered block.
    timeout_strikes: u32,
    last_incoming_block: Option<Instant>,
    unchoked_since: Option<Instant>,
}

impl PeerHandle {
    fn new(
        cmd_tx: PeerCommandSender,
        join: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            cmd_tx,
            join,
            connected: false,
            closing: false,
            peer_id: None,
            reserved: [0; 8],
            pieces: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            counters: ThruputCounters::default(),
            outstanding: Vec::new(),
            timeout_strikes: 0,
            last_incoming_block: None,
            unchoked_since: None,
        }
    }

    fn send(&self, cmd: PeerCommand) {
        // a closed channel means the session is already winding down and
        // its Disconnected event is in flight; nothing to do
        let _ = self.cmd_tx.send(cmd);
    }
}

struct Torrent {
    descriptor: Arc<TorrentDescriptor>,
    conf: TorrentConf,
    client_id: PeerId,
    storage: Arc<dyn Storage>,
    checkpoints: Arc<dyn CheckpointSink>,
    peer_source: Arc<dyn PeerSource>,
    events: EventSender,
    cmd_rx: UnboundedReceiver<TorrentCommand>,

    peer_events_tx: UnboundedSender<(SocketAddr, PeerEvent)>,
    peer_events_rx: UnboundedReceiver<(SocketAddr, PeerEvent)>,
    verify_tx: UnboundedSender<VerifyResult>,
    verify_rx: UnboundedReceiver<VerifyResult>,

    status: Status,
    own_pieces: Bitfield,
    picker: PiecePicker,
    downloads: HashMap<PieceIndex, PieceDownload>,
    /// Pieces handed to the verifier whose verdict is pending.
    verifying: HashSet<PieceIndex>,
    peers: HashMap<SocketAddr, PeerHandle>,
    choker: Choker,
    endgame: bool,

    down_limiter: Limiter,
    up_limiter: Limiter,
    counters: ThruputCounters,
    /// Byte totals carried over from a resumed checkpoint.
    resumed: (u64, u64, u64),

    /// Peers banned for repeatedly contributing bad data.
    blacklist: LruCache<SocketAddr, ()>,
    /// Hash failure count per contributing peer.
    suspicion: HashMap<SocketAddr, u32>,
    /// Recently failed or misbehaved endpoints and when they may be
    /// re-dialed.
    damped: LruCache<SocketAddr, Instant>,

    dirty: bool,
    last_stats: Instant,
    last_choke: Instant,
    last_optimistic: Instant,
    last_peer_refresh: Option<Instant>,
    last_autosave: Instant,
}

impl Torrent {
    fn new(
        params: TorrentParams,
        cmd_rx: UnboundedReceiver<TorrentCommand>,
    ) -> Self {
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (verify_tx, verify_rx) = mpsc::unbounded_channel();

        let piece_count = params.descriptor.piece_count();
        let mut own_pieces = params.descriptor.empty_bitfield();
        let mut blacklist = LruCache::new(
            NonZeroUsize::new(params.conf.blacklist_capacity.max(1))
                .expect("max(1) is nonzero"),
        );
        let mut resumed = (0, 0, 0);
        if let Some(checkpoint) = &params.resume {
            let mut resumed_pieces =
                Bitfield::from_vec(checkpoint.verified_pieces.clone());
            resumed_pieces.resize(piece_count, false);
            own_pieces = resumed_pieces;
            for addr in &checkpoint.blacklist {
                blacklist.put(*addr, ());
            }
            resumed = (
                checkpoint.downloaded,
                checkpoint.uploaded,
                checkpoint.wasted,
            );
        }

        let picker = PiecePicker::new(&own_pieces, params.conf.sequential);
        let choker = Choker::new(params.conf.unchoke_slots);
        let down_limiter = Limiter::new(
            params.conf.download_rate_limit,
            params.global_down,
        );
        let up_limiter =
            Limiter::new(params.conf.upload_rate_limit, params.global_up);
        let now = Instant::now();

        Self {
            descriptor: params.descriptor,
            conf: params.conf,
            client_id: params.client_id,
            storage: params.storage,
            checkpoints: params.checkpoints,
            peer_source: params.peer_source,
            events: params.events,
            cmd_rx,
            peer_events_tx,
            peer_events_rx,
            verify_tx,
            verify_rx,
            status: Status::Stopped,
            own_pieces,
            picker,
            downloads: HashMap::new(),
            verifying: HashSet::new(),
            peers: HashMap::new(),
            choker,
            endgame: false,
            down_limiter,
            up_limiter,
            counters: ThruputCounters::default(),
            resumed,
            blacklist,
            suspicion: HashMap::new(),
            damped: LruCache::new(
                NonZeroUsize::new(1024).expect("nonzero"),
            ),
            dirty: false,
            last_stats: now,
            last_choke: now,
            last_optimistic: now,
            last_peer_refresh: None,
            last_autosave: now,
        }
    }

    fn info_hash(&self) -> crate::InfoHash {
        self.descriptor.info_hash
    }

    async fn run(&mut self) {
        let _ = self.events.send(TorrentEvent::TorrentAdded {
            info_hash: self.info_hash(),
        });

        let mut heartbeat = interval(TICK);
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some((addr, event)) = self.peer_events_rx.recv() => {
                    self.handle_peer_event(addr, event).await;
                }
                Some(result) = self.verify_rx.recv() => {
                    self.handle_verify_result(result).await;
                }
                _ = heartbeat.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Returns true when the task should exit.
    async fn handle_command(&mut self, cmd: TorrentCommand) -> bool {
        match cmd {
            TorrentCommand::Start => self.start().await,
            TorrentCommand::Pause => self.pause(),
            TorrentCommand::Resume => self.resume(),
            TorrentCommand::Stop => self.stop().await,
            TorrentCommand::Recheck => self.recheck().await,
            TorrentCommand::InboundPeer { socket, handshake } => {
                self.accept_peer(socket, handshake);
            }
            TorrentCommand::QueryStats { reply } => {
                let _ = reply.send((self.status, self.stats()));
            }
            TorrentCommand::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // -- lifecycle ----------------------------------------------------------

    async fn start(&mut self) {
        if !matches!(self.status, Status::Stopped) {
            return;
        }
        self.set_status(Status::Checking);
        if self.picker.own_count() > 0 {
            // don't trust a resumed bitfield until storage agrees with it
            self.verify_own_pieces().await;
        }
        // verification may have parked the torrent in paused or error
        if !matches!(self.status, Status::Checking) {
            return;
        }
        self.enter_transfer_state();
        self.connect_to_peers().await;
    }

    fn pause(&mut self) {
        if matches!(self.status, Status::Downloading | Status::Seeding) {
            self.set_status(Status::Paused);
            // in-flight requests are left to arrive or time out; no new
            // ones are issued while paused
        }
    }

    fn resume(&mut self) {
        if matches!(self.status, Status::Paused) {
            self.enter_transfer_state();
            self.refill_all_peers();
        }
    }

    async fn stop(&mut self) {
        if matches!(self.status, Status::Stopped) {
            return;
        }

        let peers = std::mem::take(&mut self.peers);
        for handle in peers.values() {
            handle.send(PeerCommand::Shutdown);
        }
        let joins = peers.into_iter().map(|(_, handle)| handle.join);
        let _ = timeout(STOP_GRACE, futures::future::join_all(joins)).await;

        // in-flight verifications complete but their verdicts are discarded
        self.downloads.clear();
        self.verifying.clear();
        self.endgame = false;
        self.picker = PiecePicker::new(&self.own_pieces, self.conf.sequential);

        if !matches!(self.status, Status::Error) {
            self.set_status(Status::Stopped);
        }
        self.checkpoint().await;
        if let Err(e) = self.storage.flush(self.info_hash()).await {
            log::warn!("final flush failed: {}", e);
        }
    }

    async fn recheck(&mut self) {
        if matches!(self.status, Status::Stopped | Status::Error) {
            return;
        }
        self.set_status(Status::Checking);
        self.downloads.clear();
        self.verifying.clear();
        self.endgame = false;
        self.verify_own_pieces().await;
        if !matches!(self.status, Status::Checking) {
            return;
        }
        self.enter_transfer_state();
        self.refill_all_peers();
    }

    /// Moves to downloading or seeding depending on completeness.
    fn enter_transfer_state(&mut self) {
        if self.picker.own_count() == self.descriptor.piece_count() {
            self.set_status(Status::Seeding);
        } else {
            self.set_status(Status::Downloading);
        }
    }

    fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        log::info!(
            "torrent {} {:?} -> {:?}",
            hex::encode(self.info_hash()),
            self.status,
            status
        );
        self.status = status;
        self.dirty = true;
        let _ = self.events.send(TorrentEvent::StatusChanged {
            info_hash: self.info_hash(),
            status,
        });
    }

    /// Reads every piece the bitfield claims back from storage and drops
    /// the ones that no longer hash. The picker is rebuilt afterwards, so
    /// this runs with no active downloads.
    async fn verify_own_pieces(&mut self) {
        debug_assert!(self.downloads.is_empty());
        for index in 0..self.descriptor.piece_count() {
            if !self.own_pieces[index] {
                continue;
            }
            match self.read_piece(index).await {
                Ok(data) => {
                    let expected = match self.descriptor.piece_hash(index) {
                        Ok(hash) => hash,
                        Err(_) => return self.fatal("piece hash missing"),
                    };
                    if verifier::piece_hash(&data) != expected {
                        log::warn!(
                            "resumed piece {} fails verification, dropping",
                            index
                        );
                        self.own_pieces.set(index, false);
                        self.dirty = true;
                    }
                }
                Err(e) => {
                    self.storage_error(e);
                    break;
                }
            }
        }
        // rebuild the picker from the surviving pieces, keeping peer
        // availability
        let mut picker =
            PiecePicker::new(&self.own_pieces, self.conf.sequential);
        for handle in self.peers.values() {
            if let Some(pieces) = &handle.pieces {
                picker.register_availability(pieces);
            }
        }
        self.picker = picker;
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let piece_len = self.descriptor.piece_len(index)?;
        let mut data = Vec::with_capacity(piece_len as usize);
        let mut offset = 0;
        while offset < piece_len {
            let len = (piece_len - offset).min(BLOCK_LEN);
            let block = self
                .storage
                .read_block(self.info_hash(), index, offset, len)
                .await?;
            data.extend_from_slice(&block);
            offset += len;
        }
        Ok(data)
    }

    /// A storage failure pauses the torrent but keeps its connections, so
    /// the operator can fix the disk and resume.
    fn storage_error(&mut self, e: Error) {
        log::error!(
            "torrent {} storage error: {}",
            hex::encode(self.info_hash()),
            e
        );
        self.set_status(Status::Paused);
    }

    /// An invariant violation: give up on the torrent but not the process.
    fn fatal(&mut self, reason: &str) {
        log::error!(
            "torrent {} invariant violation: {}",
            hex::encode(self.info_hash()),
            reason
        );
        self.set_status(Status::Error);
        for handle in self.peers.values() {
            handle.send(PeerCommand::Shutdown);
        }
    }

    // -- peer connections ---------------------------------------------------

    fn transfer_active(&self) -> bool {
        matches!(self.status, Status::Downloading | Status::Seeding)
    }

    async fn connect_to_peers(&mut self) {
        if !self.transfer_active() {
            return;
        }
        let connecting =
            self.peers.values().filter(|p| !p.connected).count();
        let headroom = self
            .conf
            .max_connected_peer_count
            .saturating_sub(self.peers.len())
            .min(self.conf.max_connecting_count.saturating_sub(connecting));
        if headroom == 0 {
            return;
        }

        let candidates = self
            .peer_source
            .next_peers(self.info_hash(), headroom * 2)
            .await;
        let now = Instant::now();
        let mut started = 0;
        for addr in candidates {
            if started == headroom {
                break;
            }
            if self.peers.contains_key(&addr)
                || self.blacklist.contains(&addr)
            {
                continue;
            }
            if let Some(until) = self.damped.get(&addr) {
                if *until > now {
                    continue;
                }
            }
            self.spawn_outbound(addr);
            started += 1;
        }
    }

    fn peer_session_args(&self, addr: SocketAddr) -> PeerSessionArgs {
        PeerSessionArgs {
            addr,
            descriptor: Arc::clone(&self.descriptor),
            client_id: self.client_id,
            conf: self.conf.clone(),
            own_pieces: self.own_pieces.clone(),
            storage: Arc::clone(&self.storage),
            up_limiter: self.up_limiter.clone(),
            down_limiter: self.down_limiter.clone(),
            events: self.peer_events_tx.clone(),
        }
    }

    fn spawn_outbound(&mut self, addr: SocketAddr) {
        log::debug!("dialing peer {}", addr);
        let (session, cmd_tx) =
            PeerSession::outbound(self.peer_session_args(addr));
        let join = tokio::spawn(session.run());
        self.peers.insert(addr, PeerHandle::new(cmd_tx, join));
    }

    fn accept_peer(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) {
        let addr = match socket.get_ref().peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if !self.transfer_active()
            || self.peers.len() >= self.conf.max_connected_peer_count
            || self.peers.contains_key(&addr)
            || self.blacklist.contains(&addr)
        {
            log::debug!("refusing inbound peer {}", addr);
            return;
        }
        log::debug!("accepting inbound peer {}", addr);
        let (session, cmd_tx) = PeerSession::inbound(
            self.peer_session_args(addr),
            socket,
            handshake,
        );
        let join = tokio::spawn(session.run());
        self.peers.insert(addr, PeerHandle::new(cmd_tx, join));
    }

    fn disconnect_peer(&mut self, addr: SocketAddr) {
        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.closing = true;
            handle.send(PeerCommand::Shutdown);
        }
    }

    // -- peer events --------------------------------------------------------

    async fn handle_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer_id, reserved } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.connected = true;
                    handle.peer_id = Some(peer_id);
                    handle.reserved = reserved;
                    log::debug!(
                        "peer {} connected with id {}, extension bits {}",
                        addr,
                        handle.peer_id.map(hex::encode).unwrap_or_default(),
                        hex::encode(handle.reserved)
                    );
                    let _ = self.events.send(TorrentEvent::PeerConnected {
                        info_hash: self.info_hash(),
                        addr,
                    });
                }
            }
            PeerEvent::Bitfield(bitfield) => {
                self.handle_bitfield(addr, bitfield);
            }
            PeerEvent::Have { piece_index } => {
                self.handle_have(addr, piece_index);
            }
            PeerEvent::Choked => {
                let outstanding = match self.peers.get_mut(&addr) {
                    Some(handle) => {
                        handle.peer_choking = true;
                        // everything outstanding dies with the choke and
                        // becomes requestable elsewhere
                        std::mem::take(&mut handle.outstanding)
                    }
                    None => return,
                };
                for block in outstanding {
                    if let Some(download) =
                        self.downloads.get_mut(&block.piece_index)
                    {
                        download.remove_peer(addr);
                    }
                }
                self.refill_all_peers();
            }
            PeerEvent::Unchoked => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.peer_choking = false;
                }
                self.refill_peer(addr);
            }
            PeerEvent::Interested => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.peer_interested = true;
                }
            }
            PeerEvent::NotInterested => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.peer_interested = false;
                }
            }
            PeerEvent::Block { block, data } => {
                self.handle_block(addr, block, data);
            }
            PeerEvent::Uploaded { bytes } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.counters.up.add(bytes as u64);
                }
                self.counters.up.add(bytes as u64);
            }
            PeerEvent::Disconnected { error } => {
                self.handle_disconnect(addr, error).await;
            }
        }
    }

    fn handle_bitfield(&mut self, addr: SocketAddr, mut bitfield: Bitfield) {
        let piece_count = self.descriptor.piece_count();
        // the wire bitfield is padded to a byte boundary; the pad bits must
        // be zero and the length must match our piece count
        let expected_bytes = (piece_count + 7) / 8;
        if bitfield.len() != expected_bytes * 8
            || bitfield[piece_count..].any()
        {
            log::warn!("peer {} sent an invalid bitfield", addr);
            self.damp(addr);
            self.disconnect_peer(addr);
            return;
        }
        bitfield.resize(piece_count, false);

        let interesting = self.picker.register_availability(&bitfield);
        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.pieces = Some(bitfield);
            if interesting && !handle.am_interested {
                handle.am_interested = true;
                handle.send(PeerCommand::Interested);
            }
        }
    }

    fn handle_have(&mut self, addr: SocketAddr, piece_index: PieceIndex) {
        let piece_count = self.descriptor.piece_count();
        if piece_index >= piece_count {
            log::warn!("peer {} announced invalid piece {}", addr, piece_index);
            self.damp(addr);
            self.disconnect_peer(addr);
            return;
        }

        // record the bit first; a repeated have must not double-count
        // availability
        let choked = match self.peers.get_mut(&addr) {
            Some(handle) => {
                let pieces = handle
                    .pieces
                    .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
                if pieces[piece_index] {
                    return;
                }
                pieces.set(piece_index, true);
                handle.peer_choking
            }
            None => return,
        };

        let interesting = self.picker.register_have(piece_index);
        if interesting {
            if let Some(handle) = self.peers.get_mut(&addr) {
                if !handle.am_interested {
                    handle.am_interested = true;
                    handle.send(PeerCommand::Interested);
                }
            }
        }
        if !choked {
            self.refill_peer(addr);
        }
    }

    fn handle_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Vec<u8>,
    ) {
        let handle = match self.peers.get_mut(&addr) {
            Some(handle) => handle,
            None => return,
        };
        handle.counters.down.add(block.len as u64);
        self.counters.down.add(block.len as u64);
        handle.last_incoming_block = Some(Instant::now());
        handle.timeout_strikes = 0;

        let was_requested =
            match handle.outstanding.iter().position(|b| *b == block) {
                Some(pos) => {
                    handle.outstanding.remove(pos);
                    true
                }
                None => false,
            };

        let download = match self.downloads.get_mut(&block.piece_index) {
            Some(download) => download,
            None => {
                // a block for a piece that is no longer in flight (already
                // verified or reset); pure waste
                if !was_requested {
                    log::debug!("peer {} sent unsolicited block {}", addr, block);
                }
                self.counters.waste += block.len as u64;
                return;
            }
        };
        if self.verifying.contains(&block.piece_index) {
            self.counters.waste += block.len as u64;
            return;
        }

        match download.received_block(block, addr, data) {
            BlockReceipt::Accepted { cancel } => {
                for other in cancel {
                    if let Some(other_handle) = self.peers.get_mut(&other) {
                        other_handle.outstanding.retain(|b| *b != block);
                        other_handle.send(PeerCommand::Cancel(block));
                    }
                }
            }
            BlockReceipt::Ignored => {
                self.counters.waste += block.len as u64;
            }
        }

        if download.is_complete() {
            let index = block.piece_index;
            let data = download.assemble();
            let expected = match self.descriptor.piece_hash(index) {
                Ok(hash) => hash,
                Err(_) => return self.fatal("piece hash missing"),
            };
            self.verifying.insert(index);
            verifier::spawn_verify(index, expected, data, self.verify_tx.clone());
        }

        self.refill_peer(addr);
    }

    async fn handle_disconnect(
        &mut self,
        addr: SocketAddr,
        error: Option<PeerError>,
    ) {
        let handle = match self.peers.remove(&addr) {
            Some(handle) => handle,
            None => return,
        };

        match &error {
            Some(PeerError::Protocol(_)) => self.damp(addr),
            Some(_) if !handle.connected => {
                // never got through; let the oracle dampen the endpoint
                self.peer_source
                    .report_failure(self.info_hash(), addr)
                    .await;
            }
            _ => {}
        }

        if let Some(pieces) = &handle.pieces {
            self.picker.unregister_availability(pieces);
        }
        for download in self.downloads.values_mut() {
            download.remove_peer(addr);
        }
        // downloads the departed peer alone was driving go back to the
        // picker so any strategy re-evaluates them fresh
        let orphaned: Vec<PieceIndex> = self
            .downloads
            .iter()
            .filter(|(index, download)| {
                !self.verifying.contains(index) && download.is_untouched()
            })
            .map(|(index, _)| *index)
            .collect();
        for index in orphaned {
            self.downloads.remove(&index);
            self.picker.return_piece(index);
        }

        if handle.connected {
            let _ = self.events.send(TorrentEvent::PeerDisconnected {
                info_hash: self.info_hash(),
                addr,
            });
        }
        self.refill_all_peers();
    }

    fn damp(&mut self, addr: SocketAddr) {
        self.damped
            .put(addr, Instant::now() + self.conf.redial_damping);
    }

    // -- verification -------------------------------------------------------

    async fn handle_verify_result(&mut self, result: VerifyResult) {
        let index = result.piece_index;
        if !self.verifying.remove(&index) {
            // the torrent was stopped or rechecked while this piece was in
            // the verifier; the verdict is stale
            return;
        }
        let download = match self.downloads.remove(&index) {
            Some(download) => download,
            None => return,
        };

        if result.is_valid {
            self.complete_piece(index, result.data, &download).await;
        } else {
            self.fail_piece(index, &download);
        }
    }

    async fn complete_piece(
        &mut self,
        index: PieceIndex,
        data: Vec<u8>,
        download: &PieceDownload,
    ) {
        // storage first: the bitfield must never claim a piece that isn't
        // durable
        let mut offset = 0u32;
        for chunk in data.chunks(BLOCK_LEN as usize) {
            if let Err(e) = self
                .storage
                .write_block(self.info_hash(), index, offset, chunk)
                .await
            {
                // the piece has to be re-downloaded once storage recovers
                self.picker.return_piece(index);
                self.storage_error(e.into());
                return;
            }
            offset += chunk.len() as u32;
        }

        self.own_pieces.set(index, true);
        self.picker.received_piece(index);
        self.dirty = true;
        for addr in download.contributors() {
            self.suspicion.remove(addr);
        }
        let _ = self.events.send(TorrentEvent::PieceVerified {
            info_hash: self.info_hash(),
            piece_index: index,
        });

        // announce to everyone that doesn't have it, and drop interest in
        // peers that have nothing left for us
        let picker = &self.picker;
        for handle in self.peers.values_mut() {
            let peer_has = handle
                .pieces
                .as_ref()
                .map(|pieces| pieces[index])
                .unwrap_or(false);
            if !peer_has {
                handle.send(PeerCommand::Have { piece_index: index });
            }
            if handle.am_interested {
                let still_interesting = handle
                    .pieces
                    .as_ref()
                    .map(|pieces| picker.is_interesting(pieces))
                    .unwrap_or(false);
                if !still_interesting {
                    handle.am_interested = false;
                    handle.send(PeerCommand::NotInterested);
                }
            }
        }

        if self.picker.own_count() == self.descriptor.piece_count() {
            self.endgame = false;
            self.set_status(Status::Seeding);
        } else {
            self.refill_all_peers();
        }
    }

    fn fail_piece(&mut self, index: PieceIndex, download: &PieceDownload) {
        let piece_len = self
            .descriptor
            .piece_len(index)
            .unwrap_or(self.descriptor.piece_len);
        self.counters.waste += piece_len as u64;
        self.dirty = true;
        let _ = self.events.send(TorrentEvent::PieceFailed {
            info_hash: self.info_hash(),
            piece_index: index,
        });

        // suspicion sticks to everyone who contributed; repeat offenders
        // are banned for the session
        for addr in download.contributors() {
            let strikes = self.suspicion.entry(*addr).or_insert(0);
            *strikes += 1;
            if *strikes >= self.conf.suspicion_threshold {
                log::warn!(
                    "blacklisting peer {} after {} bad pieces",
                    addr,
                    strikes
                );
                self.blacklist.put(*addr, ());
                self.suspicion.remove(addr);
                self.disconnect_peer(*addr);
            }
        }

        self.picker.return_piece(index);
        self.refill_all_peers();
    }

    // -- request scheduling -------------------------------------------------

    fn refill_all_peers(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, handle)| {
                handle.connected
                    && !handle.closing
                    && !handle.peer_choking
                    && handle.am_interested
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            self.refill_peer(addr);
        }
    }

    /// Tops the peer's request pipeline up to its adaptive depth.
    fn refill_peer(&mut self, addr: SocketAddr) {
        if !matches!(self.status, Status::Downloading) {
            return;
        }
        let (pieces, target, outstanding) = {
            let handle = match self.peers.get(&addr) {
                Some(handle) => handle,
                None => return,
            };
            if !handle.connected
                || handle.closing
                || handle.peer_choking
                || !handle.am_interested
            {
                return;
            }
            let pieces = match &handle.pieces {
                Some(pieces) => pieces.clone(),
                None => return,
            };
            (pieces, self.pipeline_len(handle), handle.outstanding.len())
        };
        if outstanding >= target {
            return;
        }

        let mut to_request = Vec::with_capacity(target - outstanding);
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        // two passes at most: if the first pass exhausts the picker and
        // flips the torrent into endgame, the second pass picks duplicates
        for _ in 0..2 {
            let need = target - outstanding - to_request.len();
            if need == 0 {
                break;
            }

            // continuing active downloads first keeps the number of
            // half-done pieces low
            for (index, download) in self.downloads.iter_mut() {
                let need = target - outstanding - to_request.len();
                if need == 0 {
                    break;
                }
                if self.verifying.contains(index) || !pieces[*index] {
                    continue;
                }
                download.pick_blocks(
                    need,
                    addr,
                    now,
                    self.endgame,
                    &mut to_request,
                );
            }

            loop {
                let need = target - outstanding - to_request.len();
                if need == 0 {
                    break;
                }
                match self.picker.pick_piece(&pieces, &mut rng) {
                    Some(index) => {
                        let piece_len =
                            match self.descriptor.piece_len(index) {
                                Ok(len) => len,
                                Err(_) => {
                                    return self
                                        .fatal("picked an invalid piece")
                                }
                            };
                        let mut download =
                            PieceDownload::new(index, piece_len);
                        download.pick_blocks(
                            need,
                            addr,
                            now,
                            false,
                            &mut to_request,
                        );
                        self.downloads.insert(index, download);
                    }
                    None => break,
                }
            }

            if !self.endgame && self.enters_endgame() {
                log::info!(
                    "torrent {} entering endgame",
                    hex::encode(self.info_hash())
                );
                self.endgame = true;
                continue;
            }
            break;
        }

        if to_request.is_empty() {
            return;
        }
        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.outstanding.extend_from_slice(&to_request);
            handle.send(PeerCommand::Request(to_request));
        }
    }

    /// Endgame starts when every piece we lack is being downloaded and none
    /// of those downloads has a free block left.
    fn enters_endgame(&self) -> bool {
        self.picker.all_missing_pending()
            && self
                .downloads
                .iter()
                .filter(|(index, _)| !self.verifying.contains(*index))
                .all(|(_, download)| download.is_fully_requested())
    }

    /// The bandwidth-delay sizing of a peer's pipeline: one block per
    /// 16 KiB/s of observed rate, clamped, with a fixed depth before any
    /// rate data exists.
    fn pipeline_len(&self, handle: &PeerHandle) -> usize {
        let rate = handle.counters.down.avg();
        if rate == 0 {
            self.conf.default_pipeline_len
        } else {
            ((rate / BLOCK_LEN as u64) as usize)
                .max(self.conf.min_pipeline_len)
                .min(self.conf.max_pipeline_len)
        }
    }

    // -- the tick ladder ----------------------------------------------------

    async fn tick(&mut self) {
        let now = Instant::now();

        if now.saturating_duration_since(self.last_stats) >= STATS_INTERVAL {
            self.last_stats = now;
            self.stats_tick();
            self.scan_request_timeouts(now);
        }

        if !self.transfer_active() {
            return;
        }

        if now.saturating_duration_since(self.last_choke)
            >= self.conf.choke_interval
        {
            self.last_choke = now;
            let rotate = now.saturating_duration_since(self.last_optimistic)
                >= self.conf.optimistic_unchoke_interval;
            if rotate {
                self.last_optimistic = now;
            }
            self.choke_tick(now, rotate);
        }

        let refresh_due = match self.last_peer_refresh {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last)
                    >= self.conf.peer_refresh_interval
            }
        };
        let connected = self.peers.values().filter(|p| p.connected).count();
        if refresh_due || connected < self.conf.min_peer_count {
            self.last_peer_refresh = Some(now);
            self.connect_to_peers().await;
        }

        if self.dirty
            && now.saturating_duration_since(self.last_autosave)
                >= self.conf.autosave_interval
        {
            self.last_autosave = now;
            self.checkpoint().await;
        }
    }

    fn stats_tick(&mut self) {
        self.counters.tick();
        for handle in self.peers.values_mut() {
            handle.counters.tick();
        }
        let _ = self.events.send(TorrentEvent::StatsTick {
            info_hash: self.info_hash(),
            stats: self.stats(),
        });
    }

    fn stats(&self) -> TorrentStats {
        TorrentStats {
            piece_count: self.descriptor.piece_count(),
            verified_piece_count: self.picker.own_count(),
            download_rate: self.counters.down.avg(),
            upload_rate: self.counters.up.avg(),
            peer_count: self.peers.values().filter(|p| p.connected).count(),
            downloaded: self.resumed.0 + self.counters.down.total(),
            uploaded: self.resumed.1 + self.counters.up.total(),
            wasted: self.resumed.2 + self.counters.waste,
        }
    }

    /// Cancels block requests that outlived the request timeout, strikes
    /// the peers that sat on them, and cuts peers that struck out.
    fn scan_request_timeouts(&mut self, now: Instant) {
        let mut struck: Vec<SocketAddr> = Vec::new();
        for (index, download) in self.downloads.iter_mut() {
            if self.verifying.contains(index) {
                continue;
            }
            for (block, waiting_on) in download
                .free_timed_out_blocks(now, self.conf.request_timeout)
            {
                log::debug!("request for {} timed out", block);
                for addr in waiting_on {
                    if let Some(handle) = self.peers.get_mut(&addr) {
                        handle.outstanding.retain(|b| *b != block);
                        handle.timeout_strikes += 1;
                        handle.send(PeerCommand::Cancel(block));
                        if handle.timeout_strikes
                            >= self.conf.request_failure_threshold
                        {
                            struck.push(addr);
                        }
                    }
                }
            }
        }
        for addr in struck {
            log::info!("peer {} struck out on requests, dropping", addr);
            self.disconnect_peer(addr);
        }
        // freed blocks become another peer's work
        self.refill_all_peers();
    }

    fn choke_tick(&mut self, now: Instant, rotate: bool) {
        let seeding = matches!(self.status, Status::Seeding);
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, handle)| handle.connected && !handle.closing)
            .map(|(addr, handle)| {
                let snubbed = !handle.am_choking
                    && !seeding
                    && handle.am_interested
                    && now
                        .saturating_duration_since(
                            handle
                                .last_incoming_block
                                .or(handle.unchoked_since)
                                .unwrap_or(now),
                        )
                        >= self.conf.snub_timeout;
                ChokeCandidate {
                    addr: *addr,
                    interested: handle.peer_interested,
                    unchoked: !handle.am_choking,
                    rate: if seeding {
                        handle.counters.up.avg()
                    } else {
                        handle.counters.down.avg()
                    },
                    snubbed,
                }
            })
            .collect();

        let decision =
            self.choker.run(&candidates, rotate, &mut rand::thread_rng());
        for addr in decision.choke {
            if let Some(handle) = self.peers.get_mut(&addr) {
                handle.am_choking = true;
                handle.unchoked_since = None;
                handle.send(PeerCommand::Choke);
            }
        }
        for addr in decision.unchoke {
            if let Some(handle) = self.peers.get_mut(&addr) {
                handle.am_choking = false;
                handle.unchoked_since = Some(now);
                handle.send(PeerCommand::Unchoke);
            }
        }
    }

    // -- checkpointing ------------------------------------------------------

    async fn checkpoint(&mut self) {
        let stats = self.stats();
        let checkpoint = Checkpoint {
            verified_pieces: self.own_pieces.as_raw_slice().to_vec(),
            piece_count: self.descriptor.piece_count(),
            blacklist: self.blacklist.iter().map(|(addr, _)| *addr).collect(),
            downloaded: stats.downloaded,
            uploaded: stats.uploaded,
            wasted: stats.wasted,
            status: self.status,
        };
        if let Err(e) =
            self.checkpoints.save(self.info_hash(), checkpoint).await
        {
            log::warn!("checkpoint save failed: {}", e);
        } else {
            self.dirty = false;
        }
    }
}
