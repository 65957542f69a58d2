//! The block level bookkeeping of a piece that is being downloaded.
//!
//! A piece is split into 16 KiB blocks, which are the wire request unit.
//! While a piece is in flight the session tracks, per block, whether it is
//! still free, which peers it has been requested from and when, and the
//! received bytes awaiting verification. Outside of endgame a block is
//! requested from at most one peer; endgame lifts that restriction and the
//! first arrival wins.

use std::{collections::BTreeMap, net::SocketAddr};

use tokio::time::Instant;

use crate::{block_count, block_len, BlockInfo, PieceIndex};

#[derive(Clone, Debug)]
enum BlockState {
    /// Not requested from anyone.
    Free,
    /// Requested from one peer, or several in endgame. The timestamp is the
    /// earliest outstanding request, which is what the timeout scan cares
    /// about.
    Requested {
        peers: Vec<SocketAddr>,
        since: Instant,
    },
    Received,
}

/// What happened when a block arrived.
#[derive(Debug, PartialEq)]
pub(crate) enum BlockReceipt {
    /// First arrival; the listed peers also have the block outstanding and
    /// should be sent a cancel.
    Accepted { cancel: Vec<SocketAddr> },
    /// The block was already received (an endgame duplicate) or was never
    /// part of this piece. The payload counts as waste.
    Ignored,
}

/// An in-flight piece download: block states plus the receive buffer.
pub(crate) struct PieceDownload {
    index: PieceIndex,
    len: u32,
    blocks: Vec<BlockState>,
    /// Received blocks by offset, ordered for assembly into the verifier
    /// input.
    data: BTreeMap<u32, Vec<u8>>,
    /// Every peer whose data was accepted into this piece. If the piece
    /// fails verification, these accumulate suspicion.
    contributors: Vec<SocketAddr>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
            data: BTreeMap::new(),
            contributors: Vec::new(),
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks up to `count` blocks to request from the given peer, in
    /// ascending offset order, and marks them requested.
    ///
    /// Outside endgame only free blocks are eligible. In endgame, blocks
    /// already requested from other peers are handed out too, so stragglers
    /// can't stall the last piece.
    pub fn pick_blocks(
        &mut self,
        count: usize,
        peer: SocketAddr,
        now: Instant,
        endgame: bool,
        out: &mut Vec<BlockInfo>,
    ) {
        let mut picked = 0;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            let eligible = match block {
                BlockState::Free => true,
                BlockState::Requested { peers, .. } => {
                    endgame && !peers.contains(&peer)
                }
                BlockState::Received => false,
            };
            if !eligible {
                continue;
            }

            match block {
                BlockState::Free => {
                    *block = BlockState::Requested {
                        peers: vec![peer],
                        since: now,
                    };
                }
                BlockState::Requested { peers, .. } => peers.push(peer),
                BlockState::Received => unreachable!(),
            }
            out.push(BlockInfo {
                piece_index: self.index,
                offset: i as u32 * crate::BLOCK_LEN,
                len: block_len(self.len, i),
            });
            picked += 1;
        }
    }

    /// Registers a received block and buffers its bytes.
    pub fn received_block(
        &mut self,
        block: BlockInfo,
        from: SocketAddr,
        data: Vec<u8>,
    ) -> BlockReceipt {
        debug_assert_eq!(block.piece_index, self.index);
        let index = block.index_in_piece();
        if index >= self.blocks.len()
            || block.len != block_len(self.len, index)
            || block.offset % crate::BLOCK_LEN != 0
        {
            return BlockReceipt::Ignored;
        }

        match std::mem::replace(&mut self.blocks[index], BlockState::Received)
        {
            BlockState::Received => {
                // endgame duplicate; keep the first copy
                self.blocks[index] = BlockState::Received;
                BlockReceipt::Ignored
            }
            BlockState::Free | BlockState::Requested { .. }
                if data.len() != block.len as usize =>
            {
                self.blocks[index] = BlockState::Free;
                BlockReceipt::Ignored
            }
            BlockState::Free => {
                // unsolicited but valid; accept it
                self.data.insert(block.offset, data);
                self.push_contributor(from);
                BlockReceipt::Accepted { cancel: Vec::new() }
            }
            BlockState::Requested { peers, .. } => {
                self.data.insert(block.offset, data);
                self.push_contributor(from);
                BlockReceipt::Accepted {
                    cancel: peers.into_iter().filter(|p| *p != from).collect(),
                }
            }
        }
    }

    fn push_contributor(&mut self, peer: SocketAddr) {
        if !self.contributors.contains(&peer) {
            self.contributors.push(peer);
        }
    }

    /// Frees every block whose earliest request is older than the timeout,
    /// returning the freed blocks and the peers they were pending on.
    pub fn free_timed_out_blocks(
        &mut self,
        now: Instant,
        timeout: std::time::Duration,
    ) -> Vec<(BlockInfo, Vec<SocketAddr>)> {
        let mut timed_out = Vec::new();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if let BlockState::Requested { peers, since } = block {
                if now.saturating_duration_since(*since) >= timeout {
                    timed_out.push((
                        BlockInfo {
                            piece_index: self.index,
                            offset: i as u32 * crate::BLOCK_LEN,
                            len: block_len(self.len, i),
                        },
                        std::mem::take(peers),
                    ));
                    *block = BlockState::Free;
                }
            }
        }
        timed_out
    }

    /// Removes a departing peer from all request lists. Blocks it was the
    /// only requester of become free again.
    pub fn remove_peer(&mut self, peer: SocketAddr) {
        for block in self.blocks.iter_mut() {
            if let BlockState::Requested { peers, .. } = block {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *block = BlockState::Free;
                }
            }
        }
    }

    /// True once every block has been received.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b, BlockState::Received))
    }

    /// True if no block is free, i.e. everything missing is requested. Used
    /// for endgame detection.
    pub fn is_fully_requested(&self) -> bool {
        !self.blocks.iter().any(|b| matches!(b, BlockState::Free))
    }

    /// True if nothing has been requested or received; such a download can
    /// be abandoned without losing anything.
    pub fn is_untouched(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b, BlockState::Free))
    }

    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| !matches!(b, BlockState::Received))
            .count()
    }

    pub fn contributors(&self) -> &[SocketAddr] {
        &self.contributors
    }

    /// Concatenates the received blocks into the piece's bytes for
    /// verification and the storage sink.
    ///
    /// May only be called on a complete piece.
    pub fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut bytes = Vec::with_capacity(self.len as usize);
        for block in self.data.values() {
            bytes.extend_from_slice(block);
        }
        debug_assert_eq!(bytes.len(), self.len as usize);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn block(piece: PieceIndex, index: usize, piece_len: u32) -> BlockInfo {
        BlockInfo {
            piece_index: piece,
            offset: index as u32 * BLOCK_LEN,
            len: block_len(piece_len, index),
        }
    }

    #[test]
    fn test_pick_blocks_ascending_and_bounded() {
        let piece_len = 4 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);
        let now = Instant::now();

        let mut picked = Vec::new();
        download.pick_blocks(2, addr(1), now, false, &mut picked);
        assert_eq!(picked, vec![block(0, 0, piece_len), block(0, 1, piece_len)]);

        // the same blocks must not be handed out twice outside endgame
        let mut more = Vec::new();
        download.pick_blocks(10, addr(2), now, false, &mut more);
        assert_eq!(more, vec![block(0, 2, piece_len), block(0, 3, piece_len)]);
        assert!(download.is_fully_requested());
    }

    #[test]
    fn test_endgame_duplicates_and_cancel_set() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(3, piece_len);
        let now = Instant::now();

        let mut a = Vec::new();
        download.pick_blocks(2, addr(1), now, false, &mut a);
        // endgame: the second peer may double up on both blocks
        let mut b = Vec::new();
        download.pick_blocks(2, addr(2), now, true, &mut b);
        assert_eq!(a, b);
        // but not triple up on itself
        let mut again = Vec::new();
        download.pick_blocks(2, addr(2), now, true, &mut again);
        assert!(again.is_empty());

        // first arrival: the other requester gets a cancel
        let receipt = download.received_block(
            block(3, 0, piece_len),
            addr(1),
            vec![0; BLOCK_LEN as usize],
        );
        assert_eq!(
            receipt,
            BlockReceipt::Accepted {
                cancel: vec![addr(2)]
            }
        );

        // the duplicate arrival is waste
        let receipt = download.received_block(
            block(3, 0, piece_len),
            addr(2),
            vec![0; BLOCK_LEN as usize],
        );
        assert_eq!(receipt, BlockReceipt::Ignored);
    }

    #[test]
    fn test_completion_and_assembly() {
        let piece_len = BLOCK_LEN + 100;
        let mut download = PieceDownload::new(1, piece_len);
        let now = Instant::now();
        let mut picked = Vec::new();
        download.pick_blocks(2, addr(1), now, false, &mut picked);

        download.received_block(
            block(1, 0, piece_len),
            addr(1),
            vec![0xaa; BLOCK_LEN as usize],
        );
        assert!(!download.is_complete());
        download.received_block(block(1, 1, piece_len), addr(1), vec![0xbb; 100]);
        assert!(download.is_complete());
        assert_eq!(download.count_missing_blocks(), 0);

        let bytes = download.assemble();
        assert_eq!(bytes.len(), piece_len as usize);
        assert_eq!(bytes[0], 0xaa);
        assert_eq!(bytes[BLOCK_LEN as usize], 0xbb);
        assert_eq!(download.contributors(), &[addr(1)]);
    }

    #[test]
    fn test_wrong_length_block_ignored() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);
        let receipt = download.received_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            },
            addr(1),
            vec![0; 10],
        );
        assert_eq!(receipt, BlockReceipt::Ignored);
        assert!(!download.is_complete());
        // the block is free again and re-pickable
        let mut picked = Vec::new();
        download.pick_blocks(2, addr(2), Instant::now(), false, &mut picked);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_timeout_frees_blocks_and_names_peers() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);
        let past = Instant::now();
        let mut picked = Vec::new();
        download.pick_blocks(2, addr(9), past, false, &mut picked);

        let later = past + Duration::from_secs(61);
        let timed_out =
            download.free_timed_out_blocks(later, Duration::from_secs(60));
        assert_eq!(timed_out.len(), 2);
        assert_eq!(timed_out[0].1, vec![addr(9)]);
        assert!(!download.is_fully_requested());
    }

    #[test]
    fn test_remove_peer_frees_solo_requests() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);
        let now = Instant::now();
        let mut picked = Vec::new();
        download.pick_blocks(1, addr(1), now, false, &mut picked);
        let mut other = Vec::new();
        download.pick_blocks(1, addr(2), now, true, &mut other);

        download.remove_peer(addr(2));
        // block 0 still requested by addr(1); nothing newly free for it
        let mut repick = Vec::new();
        download.pick_blocks(2, addr(3), now, false, &mut repick);
        assert_eq!(repick, vec![block(0, 1, piece_len)]);
    }
}
