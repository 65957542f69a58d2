//! The error types used by the engine.
//!
//! Errors are split by scope: [`Error`] covers engine and torrent level
//! failures that surface to the embedding daemon, [`PeerError`] covers
//! failures that terminate a single peer connection, and [`StorageError`] is
//! what the storage collaborator reports back. Peer errors never cross a
//! session boundary; they are converted into disconnect events by the torrent
//! task that owns the connection.

use std::fmt;

use tokio::sync::mpsc;

use crate::{InfoHash, PieceIndex};

pub type Result<T> = std::result::Result<T, Error>;
pub(crate) type PeerResult<T> = std::result::Result<T, PeerError>;

/// The engine and torrent level error type.
#[derive(Debug)]
pub enum Error {
    /// A torrent with this info hash is already managed by the engine.
    Duplicate { info_hash: InfoHash },
    /// No torrent with this info hash is managed by the engine.
    NotFound { info_hash: InfoHash },
    /// The torrent descriptor is internally inconsistent (e.g. the number of
    /// piece hashes doesn't cover the download length).
    InvalidDescriptor(&'static str),
    /// A piece index outside the torrent was encountered.
    InvalidPieceIndex(PieceIndex),
    /// The storage collaborator failed. This pauses the affected torrent.
    Storage(StorageError),
    /// An internal channel was closed, meaning the task on its other end is
    /// gone. Returned by operations on an engine that has shut down.
    Shutdown,
    /// A runtime invariant was violated. The affected torrent transitions to
    /// the error state and refuses further work.
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Duplicate { info_hash } => {
                write!(f, "torrent {} already added", hex::encode(info_hash))
            }
            Self::NotFound { info_hash } => {
                write!(f, "torrent {} not found", hex::encode(info_hash))
            }
            Self::InvalidDescriptor(reason) => {
                write!(f, "invalid torrent descriptor: {}", reason)
            }
            Self::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index {}", index)
            }
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Shutdown => write!(f, "engine is shut down"),
            Self::Fatal(reason) => write!(f, "invariant violation: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// A failed send means the receiving task is gone, which only happens on
// shutdown.
impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::Shutdown
    }
}

/// The error type that terminates a single peer connection.
#[derive(Debug)]
pub enum PeerError {
    /// The remote violated the wire protocol. The connection is closed and
    /// the address is not re-dialed for a damping period.
    Protocol(ProtocolError),
    /// The TCP connect attempt did not complete within the deadline.
    ConnectTimeout,
    /// No bytes were received from the peer within the idle interval.
    IdleTimeout,
    /// The peer let too many block requests expire.
    RequestTimeout,
    /// The outbound message queue overflowed its high-watermark and could not
    /// be relieved by dropping stale cancels.
    SendQueueFull,
    /// The socket failed.
    Io(std::io::Error),
    /// The torrent task that owns this connection is gone.
    TorrentGone,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::ConnectTimeout => write!(f, "connect timed out"),
            Self::IdleTimeout => write!(f, "peer idle for too long"),
            Self::RequestTimeout => {
                write!(f, "too many expired block requests")
            }
            Self::SendQueueFull => write!(f, "send queue overflow"),
            Self::Io(e) => write!(f, "socket error: {}", e),
            Self::TorrentGone => write!(f, "torrent task gone"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<ProtocolError> for PeerError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::TorrentGone
    }
}

/// A violation of the BitTorrent wire protocol by the remote.
///
/// All variants are scoped to one connection: the codec reports them, the
/// peer session terminates on them, and the remote address sits out a
/// damping period before it may be dialed again.
#[derive(Debug)]
pub enum ProtocolError {
    /// The handshake did not start with the "BitTorrent protocol" string.
    InvalidProtocolString,
    /// The handshake advertised a different torrent than the connection was
    /// opened for.
    InfoHashMismatch,
    /// A frame's length prefix exceeds the largest legal message (a full
    /// block plus header overhead).
    FrameTooLarge(u32),
    /// A message's payload is shorter than its id demands.
    TruncatedPayload { id: u8, len: u32 },
    /// The bitfield does not match the torrent's piece count, or a trailing
    /// pad bit was set.
    InvalidBitfield,
    /// A bitfield message arrived after the availability exchange window.
    UnexpectedBitfield,
    /// A request's length field exceeds the maximum block size.
    InvalidRequestLength(u32),
    /// The obfuscated handshake failed key exchange or synchronization.
    KeyExchange,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidProtocolString => {
                write!(f, "invalid handshake protocol string")
            }
            Self::InfoHashMismatch => write!(f, "handshake info hash mismatch"),
            Self::FrameTooLarge(len) => {
                write!(f, "frame length {} exceeds maximum", len)
            }
            Self::TruncatedPayload { id, len } => {
                write!(f, "message {} payload too short: {} bytes", id, len)
            }
            Self::InvalidBitfield => write!(f, "bitfield length mismatch"),
            Self::UnexpectedBitfield => {
                write!(f, "bitfield not sent directly after handshake")
            }
            Self::InvalidRequestLength(len) => {
                write!(f, "requested block length {} exceeds maximum", len)
            }
            Self::KeyExchange => write!(f, "obfuscated handshake failed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// The codec layer surfaces IO errors through the framing traits, so the
// protocol error must be convertible into one without losing its identity.
impl From<ProtocolError> for std::io::Error {
    fn from(e: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// The error reported by the storage collaborator.
#[derive(Debug)]
pub enum StorageError {
    /// The underlying medium failed.
    Io(std::io::Error),
    /// The requested block lies outside the torrent.
    OutOfBounds,
    /// A write could not be completed atomically.
    PartialWrite,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::OutOfBounds => write!(f, "block out of bounds"),
            Self::PartialWrite => write!(f, "partial block write"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
