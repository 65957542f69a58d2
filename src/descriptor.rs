//! The parsed description of a torrent that the engine consumes.
//!
//! Metainfo files are bencoded; decoding them is the daemon's job. By the
//! time a torrent reaches the engine it has been reduced to this immutable
//! descriptor: the info hash, the piece geometry, the expected piece hashes,
//! and the file layout.

use std::{ops::Range, path::PathBuf};

use crate::{error::*, Bitfield, InfoHash, PieceIndex, Sha1Hash};

/// One file of the torrent.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Where the file lives, relative to the torrent's download root.
    pub path: PathBuf,
    /// The file's size in bytes.
    pub len: u64,
    /// The file's starting position when the torrent's files are laid out
    /// back to back as one byte sequence. The first (or only) file sits at
    /// offset 0.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The half-open range of torrent offsets the file occupies.
    pub fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_offset + self.len
    }
}

/// The immutable description of a torrent, created at add time.
#[derive(Clone, Debug)]
pub struct TorrentDescriptor {
    /// The SHA-1 hash of the torrent's bencoded info dictionary.
    pub info_hash: InfoHash,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The expected SHA-1 digest of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The torrent's files, ordered by their offset in the torrent.
    pub files: Vec<FileInfo>,
    /// Whether the torrent is private (BEP 27). The engine preserves the
    /// flag for its collaborators; it doesn't alter peer connection logic as
    /// peer discovery happens outside the engine.
    pub is_private: bool,
}

impl TorrentDescriptor {
    /// Validates the descriptor's internal consistency: the piece geometry
    /// must cover the download length exactly and the files must tile the
    /// torrent without gaps.
    pub fn validate(&self) -> Result<()> {
        if self.piece_len == 0 || !self.piece_len.is_power_of_two() {
            return Err(Error::InvalidDescriptor(
                "piece length must be a power of two",
            ));
        }
        if self.download_len == 0 {
            return Err(Error::InvalidDescriptor("download length is zero"));
        }

        let piece_len = self.piece_len as u64;
        let expected_piece_count =
            ((self.download_len + piece_len - 1) / piece_len) as usize;
        if self.piece_hashes.len() != expected_piece_count {
            return Err(Error::InvalidDescriptor(
                "piece hash count doesn't cover the download length",
            ));
        }

        let mut offset = 0;
        for file in &self.files {
            if file.torrent_offset != offset {
                return Err(Error::InvalidDescriptor(
                    "files don't tile the torrent",
                ));
            }
            offset += file.len;
        }
        if offset != self.download_len {
            return Err(Error::InvalidDescriptor(
                "file lengths don't sum to the download length",
            ));
        }

        Ok(())
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count() {
            Ok(self.last_piece_len())
        } else if index + 1 < self.piece_count() {
            Ok(self.piece_len)
        } else {
            log::error!(
                "piece {} is invalid for torrent {}",
                index,
                hex::encode(self.info_hash)
            );
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub fn last_piece_len(&self) -> u32 {
        let remainder = self.download_len % self.piece_len as u64;
        if remainder == 0 {
            self.piece_len
        } else {
            remainder as u32
        }
    }

    /// The expected hash of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        self.piece_hashes
            .get(index)
            .copied()
            .ok_or(Error::InvalidPieceIndex(index))
    }

    /// Returns an all-zero bitfield sized for this torrent.
    pub fn empty_bitfield(&self) -> Bitfield {
        Bitfield::repeat(false, self.piece_count())
    }
}
