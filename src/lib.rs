// tokio::select! expands deeply enough to blow the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

mod choke;
pub mod conf;
mod counter;
pub mod descriptor;
mod download;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod event;
mod peer;
mod picker;
mod rate;
pub mod storage;
mod torrent;
mod verifier;

use bitvec::prelude::{BitVec, Msb0};

pub use descriptor::{FileInfo, TorrentDescriptor};
pub use engine::Engine;
pub use event::{TorrentEvent, TorrentStats};
pub use torrent::Status;

/// Pieces are indexed with `usize` in memory, even though the wire carries
/// indices as 4 byte big endian integers, so that piece positions compose
/// with slices and bitfields without casts.
pub type PieceIndex = usize;

/// The position of a file in the torrent's file list.
pub type FileIndex = usize;

/// The 20 byte identifier a client picks for itself and repeats in every
/// handshake. BEP 20 documents the conventions clients use when choosing
/// one.
pub type PeerId = [u8; 20];

/// A 20 byte SHA-1 digest.
pub type Sha1Hash = [u8; 20];

/// The SHA-1 hash of a torrent's bencoded info dictionary, which identifies
/// the torrent everywhere in the engine: the session table, storage and
/// checkpoint calls, and every emitted event.
pub type InfoHash = Sha1Hash;

/// A piece map, one bit per piece, in the wire protocol's bit order: the
/// most significant bit of byte 0 stands for piece 0, the next bit for
/// piece 1, and so on. A set bit means the piece is held, so
/// `0b1010_0000...` says the owner has pieces 0 and 2.
pub type Bitfield = BitVec<u8, Msb0>;

/// The transfer granularity: requests and piece messages move blocks of
/// this many bytes (16 KiB), shorter only at the very end of a torrent.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// Names one block of one piece, the unit that request, piece, and cancel
/// messages all talk about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The piece the block belongs to.
    pub piece_index: PieceIndex,
    /// Where in the piece the block starts, in bytes.
    pub offset: u32,
    /// The block's byte length: [`BLOCK_LEN`], except possibly for the
    /// torrent's tail block.
    pub len: u32,
}

impl BlockInfo {
    /// The block's position when its piece is cut into [`BLOCK_LEN`] sized
    /// slices.
    pub fn index_in_piece(&self) -> usize {
        // only the tail block may fall short of the nominal length
        debug_assert!(self.len > 0);
        debug_assert!(self.len <= BLOCK_LEN);
        (self.offset / BLOCK_LEN) as usize
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(piece: {}, offset: {}, len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// How long the block at `index` is, in a piece of `piece_len` bytes: the
/// nominal block length, or whatever the piece has left.
///
/// # Panics
///
/// Panics when the index points past the piece's end.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(block_offset < piece_len);
    (piece_len - block_offset).min(BLOCK_LEN)
}

/// How many blocks a piece of the given length splits into, a short tail
/// counting as one.
pub(crate) fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
