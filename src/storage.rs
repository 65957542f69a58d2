//! The storage and checkpoint collaborators.
//!
//! The engine never touches the filesystem. Verified piece data goes out
//! through the block-addressed [`Storage`] trait and resumable session
//! state goes out through the [`CheckpointSink`] trait; the daemon wires in
//! real implementations. The in-memory implementations here back the test
//! suites and are handy for embedders that keep downloads in RAM.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{error::StorageError, torrent::Status, InfoHash, PieceIndex};

/// Block-addressed torrent data storage.
///
/// Writes are assumed atomic at block granularity: a write either persists
/// the whole block or fails with an error, never a prefix.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists one block of a verified piece.
    async fn write_block(
        &self,
        info_hash: InfoHash,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Reads back a block for serving an upload request.
    async fn read_block(
        &self,
        info_hash: InfoHash,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, StorageError>;

    /// Makes all previous writes for the torrent durable.
    async fn flush(&self, info_hash: InfoHash) -> Result<(), StorageError>;
}

/// Where sessions persist their resumable state.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(
        &self,
        info_hash: InfoHash,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError>;
}

/// A session's resumable state, saved on the autosave tick (when dirty) and
/// on shutdown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The verified piece bitfield, packed MSB first.
    pub verified_pieces: Vec<u8>,
    pub piece_count: usize,
    /// Peers banned for repeated bad data, to be avoided on resume.
    pub blacklist: Vec<SocketAddr>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub wasted: u64,
    pub status: Status,
}

/// RAM-backed storage, one flat buffer per torrent.
#[derive(Default)]
pub struct MemoryStorage {
    torrents: Mutex<HashMap<InfoHash, MemoryTorrent>>,
}

struct MemoryTorrent {
    piece_len: u32,
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an empty torrent buffer.
    pub fn add_torrent(
        &self,
        info_hash: InfoHash,
        piece_len: u32,
        total_len: u64,
    ) {
        self.torrents.lock().unwrap().insert(
            info_hash,
            MemoryTorrent {
                piece_len,
                data: vec![0; total_len as usize],
            },
        );
    }

    /// Registers a torrent buffer with its full contents, for seeding.
    pub fn add_seeded_torrent(
        &self,
        info_hash: InfoHash,
        piece_len: u32,
        data: Vec<u8>,
    ) {
        self.torrents
            .lock()
            .unwrap()
            .insert(info_hash, MemoryTorrent { piece_len, data });
    }

    /// A copy of the torrent's current bytes.
    pub fn contents(&self, info_hash: &InfoHash) -> Option<Vec<u8>> {
        self.torrents
            .lock()
            .unwrap()
            .get(info_hash)
            .map(|t| t.data.clone())
    }

    fn locate(
        torrent: &MemoryTorrent,
        piece_index: PieceIndex,
        offset: u32,
        len: usize,
    ) -> Result<usize, StorageError> {
        let start = piece_index * torrent.piece_len as usize + offset as usize;
        if start + len > torrent.data.len() {
            return Err(StorageError::OutOfBounds);
        }
        Ok(start)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write_block(
        &self,
        info_hash: InfoHash,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut torrents = self.torrents.lock().unwrap();
        let torrent = torrents
            .get_mut(&info_hash)
            .ok_or(StorageError::OutOfBounds)?;
        let start = Self::locate(torrent, piece_index, offset, data.len())?;
        torrent.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn read_block(
        &self,
        info_hash: InfoHash,
        piece_index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let torrents = self.torrents.lock().unwrap();
        let torrent = torrents
            .get(&info_hash)
            .ok_or(StorageError::OutOfBounds)?;
        let start = Self::locate(torrent, piece_index, offset, len as usize)?;
        Ok(torrent.data[start..start + len as usize].to_vec())
    }

    async fn flush(&self, _info_hash: InfoHash) -> Result<(), StorageError> {
        Ok(())
    }
}

/// RAM-backed checkpoint sink that remembers the latest save per torrent.
#[derive(Default)]
pub struct MemoryCheckpoints {
    saved: Mutex<HashMap<InfoHash, Checkpoint>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, info_hash: &InfoHash) -> Option<Checkpoint> {
        self.saved.lock().unwrap().get(info_hash).cloned()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpoints {
    async fn save(
        &self,
        info_hash: InfoHash,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        self.saved.lock().unwrap().insert(info_hash, checkpoint);
        Ok(())
    }
}
