//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, time::Duration};

use crate::PeerId;

/// The default torm client id.
pub const TORM_CLIENT_ID: &PeerId = b"-TM0010-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// The stock configuration: every knob at its protocol default and
    /// [`TORM_CLIENT_ID`] as the advertised client id.
    pub fn new() -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::default(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to send in handshakes.
    pub client_id: PeerId,

    /// The address on which the engine listens for inbound peer connections.
    /// If `None`, the engine is outbound-only.
    pub listen_addr: Option<SocketAddr>,

    /// The global download rate limit in bytes per second, applied across all
    /// torrents. `None` means unlimited.
    pub download_rate_limit: Option<u64>,

    /// The global upload rate limit in bytes per second, applied across all
    /// torrents. `None` means unlimited.
    pub upload_rate_limit: Option<u64>,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: *TORM_CLIENT_ID,
            listen_addr: None,
            download_rate_limit: None,
            upload_rate_limit: None,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it at add time. All the protocol timing
/// values are exposed here rather than hard-coded, so the surrounding daemon
/// may tune them; the defaults are the values the protocol was designed
/// around.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The deadline for a TCP connect attempt to a peer.
    pub connect_timeout: Duration,

    /// A connection is cut if no bytes arrive from the peer for this long.
    /// A keep-alive is sent at half this interval.
    pub idle_timeout: Duration,

    /// A block requested longer ago than this is cancelled and re-queued to
    /// another peer.
    pub request_timeout: Duration,

    /// After this many consecutive request timeouts the peer is disconnected.
    pub request_failure_threshold: u32,

    /// The number of outstanding block requests kept per peer before rate
    /// data exists to size the pipeline adaptively.
    pub default_pipeline_len: usize,

    /// The lower and upper bounds of the adaptive per-peer request pipeline.
    /// The pipeline is sized to the peer's download rate divided by the
    /// block length, clamped into this range.
    pub min_pipeline_len: usize,
    pub max_pipeline_len: usize,

    /// The interval of the regular choke round.
    pub choke_interval: Duration,

    /// The interval of the optimistic unchoke rotation.
    pub optimistic_unchoke_interval: Duration,

    /// The number of regular unchoke slots.
    pub unchoke_slots: usize,

    /// An unchoked peer that has sent no payload for this long is considered
    /// snubbed and excluded from the regular unchoke slots.
    pub snub_timeout: Duration,

    /// The number of connection attempts a torrent keeps in flight.
    pub max_connecting_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// New peer candidates are requested from the peer source when the live
    /// peer count drops below this threshold.
    pub min_peer_count: usize,

    /// The peer source is asked for fresh candidates at least this often,
    /// regardless of the live peer count.
    pub peer_refresh_interval: Duration,

    /// The high-watermark of a peer's outbound frame queue. Overflowing it
    /// closes the connection.
    pub send_queue_watermark: usize,

    /// A peer that contributed to this many hash-failed pieces is
    /// blacklisted for the rest of the session.
    pub suspicion_threshold: u32,

    /// The capacity of the per-session peer blacklist. Oldest entries are
    /// evicted beyond this.
    pub blacklist_capacity: usize,

    /// How long a peer that committed a protocol violation sits out before
    /// the torrent may dial it again.
    pub redial_damping: Duration,

    /// The interval at which a dirty session checkpoints itself.
    pub autosave_interval: Duration,

    /// Whether to fall back to the obfuscated (MSE) handshake when the
    /// plaintext handshake is rejected, and whether to lead with it.
    pub obfuscation: Obfuscation,

    /// The per-torrent download rate limit in bytes per second. Combined
    /// with the global limit by taking whichever is more restrictive at
    /// reservation time.
    pub download_rate_limit: Option<u64>,

    /// The per-torrent upload rate limit in bytes per second.
    pub upload_rate_limit: Option<u64>,

    /// Request pieces in ascending index order instead of rarest-first.
    /// Useful when the download is consumed as a stream.
    pub sequential: bool,
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            request_failure_threshold: 3,
            default_pipeline_len: 10,
            min_pipeline_len: 5,
            max_pipeline_len: 32,
            choke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            unchoke_slots: 4,
            snub_timeout: Duration::from_secs(60),
            max_connecting_count: 50,
            // enough sockets for throughput without drowning the host
            max_connected_peer_count: 50,
            min_peer_count: 30,
            peer_refresh_interval: Duration::from_secs(120),
            send_queue_watermark: 256,
            suspicion_threshold: 2,
            blacklist_capacity: 4096,
            redial_damping: Duration::from_secs(600),
            autosave_interval: Duration::from_secs(60),
            obfuscation: Obfuscation::Fallback,
            download_rate_limit: None,
            upload_rate_limit: None,
            sequential: false,
        }
    }
}

/// When, if ever, outbound connections use the obfuscated (MSE) handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Obfuscation {
    /// Only ever send plaintext handshakes.
    Disabled,
    /// Try plaintext first and retry the connection obfuscated if the peer
    /// rejects it.
    Fallback,
    /// Lead with the obfuscated handshake.
    Preferred,
}
