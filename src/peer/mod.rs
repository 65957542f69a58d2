//! One task per peer connection.
//!
//! A peer session owns exactly one TCP socket and nothing else: it performs
//! the connect and handshake, then settles into a loop that translates wire
//! messages into typed events for its torrent task and torrent commands
//! into wire frames. All download policy (what to request, whom to choke,
//! when to give up on a request) lives torrent-side; the session enforces
//! only the connection-local rules: connect and idle deadlines, keep-alives,
//! the outbound queue watermark, and serving upload requests from storage
//! under the rate limiter.

pub(crate) mod codec;
pub(crate) mod mse;

use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{interval, timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::{Obfuscation, TorrentConf},
    descriptor::TorrentDescriptor,
    error::{PeerError, PeerResult, ProtocolError},
    rate::Limiter,
    storage::Storage,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// How long a closing session waits for its final frames to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a peer session reports to its torrent. Every event is tagged with
/// the session's remote address by the sender.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The handshake completed; the connection is in its steady state.
    Connected {
        peer_id: PeerId,
        reserved: [u8; 8],
    },
    /// The peer's full piece map, sent directly after the handshake. Raw:
    /// the torrent validates the length and trailing bits.
    Bitfield(Bitfield),
    Have {
        piece_index: PieceIndex,
    },
    /// The remote choked us.
    Choked,
    /// The remote unchoked us.
    Unchoked,
    /// The remote wants our pieces.
    Interested,
    NotInterested,
    /// A requested block arrived.
    Block {
        block: BlockInfo,
        data: Vec<u8>,
    },
    /// Payload bytes served to the peer.
    Uploaded {
        bytes: u32,
    },
    /// The connection is gone; always the session's last event.
    Disconnected {
        error: Option<PeerError>,
    },
}

/// What a torrent asks of a peer session.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// Stop serving the peer's requests and tell it so.
    Choke,
    Unchoke,
    /// Announce our interest state.
    Interested,
    NotInterested,
    /// Announce a freshly verified piece (also updates the pieces this
    /// session is willing to serve).
    Have {
        piece_index: PieceIndex,
    },
    /// Put block requests on the wire.
    Request(Vec<BlockInfo>),
    /// Withdraw a block request.
    Cancel(BlockInfo),
    /// Flush and close. The session answers with a `Disconnected` event.
    Shutdown,
}

pub(crate) type PeerCommandSender = UnboundedSender<PeerCommand>;
type EventSender = UnboundedSender<(SocketAddr, PeerEvent)>;

enum Direction {
    Outbound,
    /// An accepted socket whose handshake the engine listener already read.
    Inbound {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
}

pub(crate) struct PeerSession {
    addr: SocketAddr,
    direction: Option<Direction>,
    descriptor: Arc<TorrentDescriptor>,
    client_id: PeerId,
    conf: TorrentConf,
    /// The pieces this session may serve. Seeded at spawn and kept fresh by
    /// `Have` commands passing through.
    own_pieces: Bitfield,
    storage: Arc<dyn Storage>,
    up_limiter: Limiter,
    down_limiter: Limiter,
    events: EventSender,
    cmd_rx: UnboundedReceiver<PeerCommand>,
    /// Mirror of the torrent's choke decision, consulted when serving.
    am_choking: bool,
    /// Remote requests waiting to be served, in arrival order.
    incoming_requests: VecDeque<BlockInfo>,
    /// Outbound frames waiting for the socket.
    outbox: VecDeque<Message>,
    last_incoming: Instant,
    last_outgoing: Instant,
}

/// Everything a torrent needs to spawn a session, bundled so the two
/// constructors don't take a dozen arguments each.
pub(crate) struct PeerSessionArgs {
    pub addr: SocketAddr,
    pub descriptor: Arc<TorrentDescriptor>,
    pub client_id: PeerId,
    pub conf: TorrentConf,
    pub own_pieces: Bitfield,
    pub storage: Arc<dyn Storage>,
    pub up_limiter: Limiter,
    pub down_limiter: Limiter,
    pub events: EventSender,
}

impl PeerSession {
    /// Creates a session that will dial the remote.
    pub fn outbound(args: PeerSessionArgs) -> (Self, PeerCommandSender) {
        Self::new(args, Direction::Outbound)
    }

    /// Creates a session over an accepted socket. The remote's handshake
    /// has been consumed by the acceptor; ours is still owed.
    pub fn inbound(
        args: PeerSessionArgs,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) -> (Self, PeerCommandSender) {
        Self::new(args, Direction::Inbound { socket, handshake })
    }

    fn new(
        args: PeerSessionArgs,
        direction: Direction,
    ) -> (Self, PeerCommandSender) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        (
            Self {
                addr: args.addr,
                direction: Some(direction),
                descriptor: args.descriptor,
                client_id: args.client_id,
                conf: args.conf,
                own_pieces: args.own_pieces,
                storage: args.storage,
                up_limiter: args.up_limiter,
                down_limiter: args.down_limiter,
                events: args.events,
                cmd_rx,
                am_choking: true,
                incoming_requests: VecDeque::new(),
                outbox: VecDeque::new(),
                last_incoming: now,
                last_outgoing: now,
            },
            cmd_tx,
        )
    }

    /// Drives the connection to completion and reports the terminal
    /// `Disconnected` event. This is the session task's entry point.
    pub async fn run(mut self) {
        let error = match self.start().await {
            Ok(()) => None,
            Err(e) => {
                log::info!("peer {} session ended: {}", self.addr, e);
                Some(e)
            }
        };
        let _ = self
            .events
            .send((self.addr, PeerEvent::Disconnected { error }));
    }

    async fn start(&mut self) -> PeerResult<()> {
        match self.direction.take().expect("session started twice") {
            Direction::Inbound { socket, handshake } => {
                self.start_inbound(socket, handshake).await
            }
            Direction::Outbound => self.start_outbound().await,
        }
    }

    async fn start_inbound(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> PeerResult<()> {
        log::info!("peer {} connected inbound", self.addr);
        let own_handshake =
            Handshake::new(self.descriptor.info_hash, self.client_id);
        socket.send(own_handshake).await?;
        let socket = switch_codec(socket);
        self.connected(peer_handshake, socket).await
    }

    async fn start_outbound(&mut self) -> PeerResult<()> {
        log::info!("connecting to peer {}", self.addr);
        let socket = self.connect_tcp().await?;

        match self.conf.obfuscation {
            Obfuscation::Disabled => {
                let (socket, handshake) =
                    self.handshake_plaintext(socket).await?;
                self.connected(handshake, socket).await
            }
            Obfuscation::Fallback => {
                match self.handshake_plaintext(socket).await {
                    Ok((socket, handshake)) => {
                        self.connected(handshake, socket).await
                    }
                    Err(PeerError::Io(_)) | Err(PeerError::Protocol(_)) => {
                        log::info!(
                            "peer {} rejected plaintext, retrying obfuscated",
                            self.addr
                        );
                        let socket = self.connect_tcp().await?;
                        let (socket, handshake) =
                            self.handshake_obfuscated(socket).await?;
                        self.connected(handshake, socket).await
                    }
                    Err(e) => Err(e),
                }
            }
            Obfuscation::Preferred => {
                let (socket, handshake) =
                    self.handshake_obfuscated(socket).await?;
                self.connected(handshake, socket).await
            }
        }
    }

    async fn connect_tcp(&self) -> PeerResult<TcpStream> {
        match timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
            .await
        {
            Err(_) => Err(PeerError::ConnectTimeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(socket)) => Ok(socket),
        }
    }

    /// Sends our handshake and validates the reply. Generic over the
    /// transport so the obfuscated stream slots in unchanged.
    async fn exchange_handshake<S>(
        &self,
        mut socket: Framed<S, HandshakeCodec>,
    ) -> PeerResult<(Framed<S, PeerCodec>, Handshake)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake =
            Handshake::new(self.descriptor.info_hash, self.client_id);
        socket.send(handshake).await?;

        let peer_handshake =
            match timeout(self.conf.connect_timeout, socket.next()).await {
                Err(_) => return Err(PeerError::ConnectTimeout),
                Ok(None) => {
                    return Err(PeerError::Io(
                        std::io::ErrorKind::UnexpectedEof.into(),
                    ))
                }
                Ok(Some(peer_handshake)) => peer_handshake?,
            };
        log::debug!("peer {} handshake: {:?}", self.addr, peer_handshake);

        if peer_handshake.info_hash != self.descriptor.info_hash {
            log::info!("peer {} handshake invalid info hash", self.addr);
            return Err(ProtocolError::InfoHashMismatch.into());
        }

        Ok((switch_codec(socket), peer_handshake))
    }

    async fn handshake_plaintext(
        &self,
        socket: TcpStream,
    ) -> PeerResult<(Framed<TcpStream, PeerCodec>, Handshake)> {
        self.exchange_handshake(Framed::new(socket, HandshakeCodec))
            .await
    }

    async fn handshake_obfuscated(
        &self,
        socket: TcpStream,
    ) -> PeerResult<(
        Framed<mse::ObfuscatedStream<TcpStream>, PeerCodec>,
        Handshake,
    )> {
        let obfuscated = match timeout(
            self.conf.connect_timeout,
            mse::initiate(socket, &self.descriptor.info_hash),
        )
        .await
        {
            Err(_) => return Err(PeerError::ConnectTimeout),
            Ok(result) => result?,
        };
        self.exchange_handshake(Framed::new(obfuscated, HandshakeCodec))
            .await
    }

    /// The post-handshake path shared by all connection flavors.
    async fn connected<S>(
        &mut self,
        peer_handshake: Handshake,
        socket: Framed<S, PeerCodec>,
    ) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.events.send((
            self.addr,
            PeerEvent::Connected {
                peer_id: peer_handshake.peer_id,
                reserved: peer_handshake.reserved,
            },
        ))?;

        let (mut sink, stream) = socket.split();

        // an empty bitfield message carries no information, so it is only
        // sent when we actually have something
        if self.own_pieces.any() {
            sink.send(Message::Bitfield(self.own_pieces.clone())).await?;
        }
        self.last_outgoing = Instant::now();
        self.last_incoming = Instant::now();

        let result = self.steady_state(&mut sink, stream).await;

        // orderly or not, try to get the final frames out before the socket
        // drops
        let _ = timeout(SHUTDOWN_GRACE, sink.flush()).await;
        result
    }

    /// The main loop: multiplexes the socket, the torrent's commands, and
    /// the keep-alive clock, and drains pending upload work in between.
    async fn steady_state<S>(
        &mut self,
        sink: &mut SplitSink<Framed<S, PeerCodec>, Message>,
        mut stream: SplitStream<Framed<S, PeerCodec>>,
    ) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // the first non-handshake message may be a bitfield; afterwards one
        // is a protocol violation
        let mut bitfield_window = true;
        let mut ticker = interval(Duration::from_secs(1));

        loop {
            // queued control frames go out before anything else
            while let Some(msg) = self.outbox.pop_front() {
                self.last_outgoing = Instant::now();
                sink.send(msg).await?;
            }

            tokio::select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        // remote closed the connection
                        None => return Ok(()),
                    };
                    self.last_incoming = Instant::now();
                    let closes_window = !matches!(msg, Message::KeepAlive);
                    self.handle_msg(msg, bitfield_window).await?;
                    if closes_window {
                        bitfield_window = false;
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Shutdown) | None => {
                            log::info!(
                                "shutting down peer {} session",
                                self.addr
                            );
                            return Ok(());
                        }
                        Some(cmd) => self.handle_cmd(cmd)?,
                    }
                }
                _ = ticker.tick() => {
                    self.check_deadlines()?;
                }
                // upload service runs at lower urgency, whenever nothing
                // else is ready
                _ = std::future::ready(()),
                    if !self.incoming_requests.is_empty() =>
                {
                    self.serve_next_request(sink).await?;
                }
            }
        }
    }

    /// Keep-alive and idle bookkeeping, run once a second.
    fn check_deadlines(&mut self) -> PeerResult<()> {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_incoming)
            >= self.conf.idle_timeout
        {
            log::info!("peer {} idle, disconnecting", self.addr);
            return Err(PeerError::IdleTimeout);
        }
        if now.saturating_duration_since(self.last_outgoing)
            >= self.conf.idle_timeout / 2
        {
            self.queue_frame(Message::KeepAlive)?;
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        msg: Message,
        bitfield_window: bool,
    ) -> PeerResult<()> {
        log::trace!("peer {} sent {:?}", self.addr, msg.id());
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                // only valid directly after the handshake
                if !bitfield_window {
                    return Err(ProtocolError::UnexpectedBitfield.into());
                }
                self.events
                    .send((self.addr, PeerEvent::Bitfield(bitfield)))?;
            }
            Message::Choke => {
                // our pending requests die with the choke; the torrent
                // rebuilds its pipeline bookkeeping
                self.events.send((self.addr, PeerEvent::Choked))?;
            }
            Message::Unchoke => {
                self.events.send((self.addr, PeerEvent::Unchoked))?;
            }
            Message::Interested => {
                self.events.send((self.addr, PeerEvent::Interested))?;
            }
            Message::NotInterested => {
                self.events.send((self.addr, PeerEvent::NotInterested))?;
            }
            Message::Have { piece_index } => {
                self.events
                    .send((self.addr, PeerEvent::Have { piece_index }))?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                // pace the read side; the socket simply isn't read again
                // until the tokens are paid for
                self.down_limiter.throttle(block.len as u64).await;
                self.events
                    .send((self.addr, PeerEvent::Block { block, data }))?;
            }
            Message::Request(block) => self.handle_request(block)?,
            Message::Cancel(block) => {
                let before = self.incoming_requests.len();
                self.incoming_requests.retain(|b| *b != block);
                if self.incoming_requests.len() == before {
                    log::trace!(
                        "peer {} cancelled unqueued block {}",
                        self.addr,
                        block
                    );
                }
            }
            Message::Port(port) => {
                log::trace!("peer {} announced DHT port {}", self.addr, port);
            }
        }
        Ok(())
    }

    fn handle_request(&mut self, block: BlockInfo) -> PeerResult<()> {
        if self.am_choking {
            log::debug!(
                "peer {} requested {} while choked",
                self.addr,
                block
            );
            return Ok(());
        }
        // a request storm that outpaces the serve loop is the same
        // condition as an overflowing send queue
        if self.incoming_requests.len() >= self.conf.send_queue_watermark {
            return Err(PeerError::SendQueueFull);
        }
        if !self.is_valid_request(&block) {
            log::debug!(
                "peer {} requested invalid block {}",
                self.addr,
                block
            );
            return Ok(());
        }
        self.incoming_requests.push_back(block);
        Ok(())
    }

    fn is_valid_request(&self, block: &BlockInfo) -> bool {
        // we serve at block granularity only, never oversized reads
        if block.len > crate::BLOCK_LEN {
            return false;
        }
        if block.piece_index >= self.descriptor.piece_count()
            || !self.own_pieces[block.piece_index]
        {
            return false;
        }
        match self.descriptor.piece_len(block.piece_index) {
            Ok(piece_len) => block
                .offset
                .checked_add(block.len)
                .map_or(false, |end| end <= piece_len),
            Err(_) => false,
        }
    }

    async fn serve_next_request<S>(
        &mut self,
        sink: &mut SplitSink<Framed<S, PeerCodec>, Message>,
    ) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let block = match self.incoming_requests.pop_front() {
            Some(block) => block,
            None => return Ok(()),
        };
        let data = match self
            .storage
            .read_block(
                self.descriptor.info_hash,
                block.piece_index,
                block.offset,
                block.len,
            )
            .await
        {
            Ok(data) => data,
            Err(e) => {
                // a read failure is the torrent's problem, not the peer's;
                // skip the block and let the remote re-request
                log::warn!(
                    "storage read for {} failed: {}",
                    block,
                    e
                );
                return Ok(());
            }
        };

        self.up_limiter.throttle(block.len as u64).await;
        self.last_outgoing = Instant::now();
        sink.send(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        })
        .await?;
        self.events.send((
            self.addr,
            PeerEvent::Uploaded { bytes: block.len },
        ))?;
        Ok(())
    }

    fn handle_cmd(&mut self, cmd: PeerCommand) -> PeerResult<()> {
        match cmd {
            PeerCommand::Choke => {
                self.am_choking = true;
                // choked requests are dead; a surviving remote re-requests
                self.incoming_requests.clear();
                self.queue_frame(Message::Choke)?;
            }
            PeerCommand::Unchoke => {
                self.am_choking = false;
                self.queue_frame(Message::Unchoke)?;
            }
            PeerCommand::Interested => {
                self.queue_frame(Message::Interested)?;
            }
            PeerCommand::NotInterested => {
                self.queue_frame(Message::NotInterested)?;
            }
            PeerCommand::Have { piece_index } => {
                if piece_index < self.own_pieces.len() {
                    self.own_pieces.set(piece_index, true);
                }
                self.queue_frame(Message::Have { piece_index })?;
            }
            PeerCommand::Request(blocks) => {
                for block in blocks {
                    self.queue_frame(Message::Request(block))?;
                }
            }
            PeerCommand::Cancel(block) => {
                self.queue_frame(Message::Cancel(block))?;
            }
            PeerCommand::Shutdown => unreachable!("handled by the caller"),
        }
        Ok(())
    }

    /// Queues a frame behind the watermark. On overflow, cancels that
    /// duplicate an earlier queued cancel for the same block are collapsed
    /// first; if the queue still won't fit the frame the connection is
    /// beyond saving.
    fn queue_frame(&mut self, msg: Message) -> PeerResult<()> {
        if self.outbox.len() >= self.conf.send_queue_watermark {
            let mut seen = HashSet::new();
            self.outbox.retain(|queued| match queued {
                Message::Cancel(block) => seen.insert(*block),
                _ => true,
            });
        }
        if self.outbox.len() >= self.conf.send_queue_watermark {
            return Err(PeerError::SendQueueFull);
        }
        self.outbox.push_back(msg);
        Ok(())
    }
}

/// Re-frames a handshake socket for the message protocol, keeping the read
/// buffer: the remote may have pipelined messages behind its handshake.
fn switch_codec<S>(socket: Framed<S, HandshakeCodec>) -> Framed<S, PeerCodec>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    // carry the buffered bytes over into the new framing
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}
