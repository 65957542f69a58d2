//! Piece hash verification, off the session's hot path.
//!
//! Hashing a multi-megabyte piece takes long enough to stall the event loop,
//! so assembled pieces are handed to the blocking thread pool and the
//! verdict comes back through the session's event queue. On shutdown the
//! session simply drops the receiver; in-flight verifications finish and
//! their results go nowhere.

use sha1::{Digest, Sha1};
use tokio::sync::mpsc::UnboundedSender;

use crate::{PieceIndex, Sha1Hash};

/// The verdict on one assembled piece.
#[derive(Debug)]
pub(crate) struct VerifyResult {
    pub piece_index: PieceIndex,
    pub is_valid: bool,
    /// The piece bytes, handed back so a valid piece can go straight to the
    /// storage sink without another copy.
    pub data: Vec<u8>,
}

/// Computes the SHA-1 digest of a piece.
pub(crate) fn piece_hash(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes the piece on the blocking pool and posts the verdict to the
/// session's queue. Errors on the channel are ignored: they only occur when
/// the session is already gone.
pub(crate) fn spawn_verify(
    piece_index: PieceIndex,
    expected: Sha1Hash,
    data: Vec<u8>,
    results: UnboundedSender<VerifyResult>,
) {
    tokio::task::spawn_blocking(move || {
        let is_valid = piece_hash(&data) == expected;
        if !is_valid {
            log::warn!("piece {} failed hash verification", piece_index);
        }
        let _ = results.send(VerifyResult {
            piece_index,
            is_valid,
            data,
        });
    });
}
