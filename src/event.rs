//! The event stream a session emits towards the daemon.
//!
//! Each engine hands out a single typed event channel; the UI, CLI, and IPC
//! layers subscribe outside the engine and fan events out however they
//! like. Every event names its torrent, so one stream serves any number of
//! sessions.

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{torrent::Status, InfoHash, PieceIndex};

pub type EventSender = UnboundedSender<TorrentEvent>;
pub type EventReceiver = UnboundedReceiver<TorrentEvent>;

/// What the engine reports to its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum TorrentEvent {
    /// A torrent was registered with the engine.
    TorrentAdded { info_hash: InfoHash },
    /// A piece passed hash verification and was written to storage.
    PieceVerified {
        info_hash: InfoHash,
        piece_index: PieceIndex,
    },
    /// A completed piece failed hash verification and will be
    /// re-downloaded.
    PieceFailed {
        info_hash: InfoHash,
        piece_index: PieceIndex,
    },
    /// A peer connection completed its handshake.
    PeerConnected {
        info_hash: InfoHash,
        addr: SocketAddr,
    },
    /// A peer connection ended, orderly or not.
    PeerDisconnected {
        info_hash: InfoHash,
        addr: SocketAddr,
    },
    /// The session's lifecycle state changed.
    StatusChanged {
        info_hash: InfoHash,
        status: Status,
    },
    /// The once-a-second statistics snapshot.
    StatsTick {
        info_hash: InfoHash,
        stats: TorrentStats,
    },
}

impl TorrentEvent {
    /// The torrent the event belongs to.
    pub fn info_hash(&self) -> &InfoHash {
        match self {
            Self::TorrentAdded { info_hash }
            | Self::PieceVerified { info_hash, .. }
            | Self::PieceFailed { info_hash, .. }
            | Self::PeerConnected { info_hash, .. }
            | Self::PeerDisconnected { info_hash, .. }
            | Self::StatusChanged { info_hash, .. }
            | Self::StatsTick { info_hash, .. } => info_hash,
        }
    }
}

/// A session's statistics snapshot, emitted once a second.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TorrentStats {
    pub piece_count: usize,
    pub verified_piece_count: usize,
    /// Rolling download rate, bytes per second.
    pub download_rate: u64,
    /// Rolling upload rate, bytes per second.
    pub upload_rate: u64,
    pub peer_count: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes discarded due to failed verification or duplicate arrival.
    pub wasted: u64,
}

impl TorrentStats {
    /// Completion ratio in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.piece_count == 0 {
            0.0
        } else {
            self.verified_piece_count as f64 / self.piece_count as f64
        }
    }

    /// A crude seconds-to-completion estimate from the rolling download
    /// rate and the piece counts; `None` while stalled or complete.
    pub fn eta_secs(&self, piece_len: u32) -> Option<u64> {
        let left = (self.piece_count - self.verified_piece_count) as u64
            * piece_len as u64;
        if left == 0 || self.download_rate == 0 {
            None
        } else {
            Some(left / self.download_rate)
        }
    }
}
