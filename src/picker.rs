//! The per-torrent piece selection policy.
//!
//! The picker tracks, for every piece, whether we have it, whether a
//! download of it is underway, and how many connected peers announce it.
//! Picking chooses the next piece to start on a given peer; block level
//! scheduling within a started piece is [`crate::download`]'s job.
//!
//! Strategy: the first few pieces are picked uniformly at random so the
//! session has something to upload quickly; after that the least replicated
//! piece is preferred, with ties broken by lowest index. A torrent may
//! instead be configured sequential, which always takes the lowest eligible
//! index (for consumers that stream the download).

use rand::{seq::IteratorRandom, Rng};

use crate::{Bitfield, PieceIndex};

/// How many pieces are picked at random before rarest-first kicks in.
const RANDOM_FIRST_THRESHOLD: usize = 4;

#[derive(Clone, Copy, Debug, Default)]
struct PieceState {
    /// Whether we have the verified piece.
    have: bool,
    /// Whether a download of this piece is underway.
    pending: bool,
    /// The number of connected peers that announce the piece.
    frequency: usize,
}

pub(crate) struct PiecePicker {
    pieces: Vec<PieceState>,
    own_count: usize,
    sequential: bool,
}

impl PiecePicker {
    /// Creates a picker for a torrent whose verified pieces are given in
    /// `own`.
    pub fn new(own: &Bitfield, sequential: bool) -> Self {
        let pieces = own
            .iter()
            .map(|have| PieceState {
                have: *have,
                ..PieceState::default()
            })
            .collect::<Vec<_>>();
        let own_count = pieces.iter().filter(|p| p.have).count();
        Self {
            pieces,
            own_count,
            sequential,
        }
    }

    /// The number of verified pieces.
    pub fn own_count(&self) -> usize {
        self.own_count
    }

    /// The number of peers announcing the piece.
    pub fn frequency(&self, index: PieceIndex) -> usize {
        self.pieces[index].frequency
    }

    /// Registers a connected peer's full bitfield and reports whether the
    /// peer has anything we lack.
    pub fn register_availability(&mut self, bitfield: &Bitfield) -> bool {
        debug_assert_eq!(bitfield.len(), self.pieces.len());
        let mut interesting = false;
        for (piece, has) in self.pieces.iter_mut().zip(bitfield.iter()) {
            if *has {
                piece.frequency += 1;
                interesting |= !piece.have;
            }
        }
        interesting
    }

    /// Unregisters a departing peer's bitfield.
    pub fn unregister_availability(&mut self, bitfield: &Bitfield) {
        debug_assert_eq!(bitfield.len(), self.pieces.len());
        for (piece, has) in self.pieces.iter_mut().zip(bitfield.iter()) {
            if *has {
                debug_assert!(piece.frequency > 0);
                piece.frequency -= 1;
            }
        }
    }

    /// Registers a single piece announcement and reports whether it made
    /// the peer interesting.
    pub fn register_have(&mut self, index: PieceIndex) -> bool {
        let piece = &mut self.pieces[index];
        piece.frequency += 1;
        !piece.have
    }

    /// Picks the next piece to download from a peer with the given pieces,
    /// marking it pending. Returns `None` if the peer has nothing we want
    /// that isn't already underway; the caller simply doesn't request.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
        rng: &mut impl Rng,
    ) -> Option<PieceIndex> {
        debug_assert_eq!(peer_pieces.len(), self.pieces.len());
        let candidates = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                !piece.have && !piece.pending && peer_pieces[*index]
            })
            .map(|(index, piece)| (index, piece.frequency));

        let picked = if self.sequential {
            candidates.map(|(index, _)| index).next()
        } else if self.own_count < RANDOM_FIRST_THRESHOLD {
            // bootstrap phase: grab anything, so we have upload credit fast
            candidates.map(|(index, _)| index).choose(rng)
        } else {
            // rarest first, ties by lowest index (min_by picks the first of
            // equals)
            candidates
                .min_by_key(|(_, frequency)| *frequency)
                .map(|(index, _)| index)
        };

        if let Some(index) = picked {
            self.pieces[index].pending = true;
        }
        picked
    }

    /// Marks a piece's download complete.
    pub fn received_piece(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        debug_assert!(!piece.have);
        piece.pending = false;
        piece.have = true;
        self.own_count += 1;
    }

    /// Returns a piece to the pool, after a failed verification or when its
    /// download lost all its peers.
    pub fn return_piece(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        debug_assert!(!piece.have);
        piece.pending = false;
    }

    /// Drops a verified piece, used by an explicit recheck that found it
    /// bad on storage.
    pub fn invalidate_piece(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        if piece.have {
            piece.have = false;
            self.own_count -= 1;
        }
        piece.pending = false;
    }

    /// Whether the peer with the given pieces has anything we still lack.
    pub fn is_interesting(&self, peer_pieces: &Bitfield) -> bool {
        self.pieces
            .iter()
            .zip(peer_pieces.iter())
            .any(|(piece, has)| *has && !piece.have)
    }

    /// True when every piece we lack is already being downloaded; the
    /// session uses this together with the downloads' request states to
    /// decide on endgame.
    pub fn all_missing_pending(&self) -> bool {
        self.pieces.iter().all(|piece| piece.have || piece.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn bitfield(bits: &[u8]) -> Bitfield {
        bits.iter().map(|b| *b == 1).collect()
    }

    fn picker_with_own(own: &[u8]) -> PiecePicker {
        PiecePicker::new(&bitfield(own), false)
    }

    #[test]
    fn test_pick_never_returns_owned_or_absent_pieces() {
        let mut rng = StepRng::new(7, 13);
        // own 4 pieces so rarest-first is active
        let mut picker = picker_with_own(&[1, 1, 1, 1, 0, 0, 0, 0]);
        let peer = bitfield(&[1, 1, 1, 1, 0, 1, 0, 0]);
        picker.register_availability(&peer);

        // only piece 5 is eligible: 0-3 are ours, 4/6/7 the peer lacks
        assert_eq!(picker.pick_piece(&peer, &mut rng), Some(5));
        // now pending, so nothing is left
        assert_eq!(picker.pick_piece(&peer, &mut rng), None);
    }

    #[test]
    fn test_rarest_first_with_index_tie_break() {
        let mut rng = StepRng::new(0, 1);
        let mut picker = picker_with_own(&[1, 1, 1, 1, 0, 0, 0]);
        // piece 4 on three peers, pieces 5 and 6 on one peer each
        picker.register_availability(&bitfield(&[0, 0, 0, 0, 1, 1, 0]));
        picker.register_availability(&bitfield(&[0, 0, 0, 0, 1, 0, 1]));
        picker.register_availability(&bitfield(&[0, 0, 0, 0, 1, 0, 0]));

        assert_eq!(picker.frequency(4), 3);
        assert_eq!(picker.frequency(5), 1);
        assert_eq!(picker.frequency(6), 1);

        // all pieces available on this seed; 5 and 6 tie for rarest and the
        // lower index wins
        let seed = bitfield(&[1, 1, 1, 1, 1, 1, 1]);
        picker.register_availability(&seed);
        assert_eq!(picker.pick_piece(&seed, &mut rng), Some(5));
        assert_eq!(picker.pick_piece(&seed, &mut rng), Some(6));
        assert_eq!(picker.pick_piece(&seed, &mut rng), Some(4));
        assert_eq!(picker.pick_piece(&seed, &mut rng), None);
    }

    #[test]
    fn test_availability_counts_sum_over_peers() {
        let mut picker = picker_with_own(&[0, 0, 0, 0]);
        let peers = [
            bitfield(&[1, 1, 0, 0]),
            bitfield(&[1, 0, 1, 0]),
            bitfield(&[1, 1, 1, 0]),
        ];
        for peer in &peers {
            picker.register_availability(peer);
        }
        for index in 0..4 {
            let expected: usize =
                peers.iter().map(|p| p[index] as usize).sum();
            assert_eq!(picker.frequency(index), expected);
        }

        picker.unregister_availability(&peers[2]);
        assert_eq!(picker.frequency(0), 2);
        assert_eq!(picker.frequency(2), 1);
        assert_eq!(picker.frequency(3), 0);
    }

    #[test]
    fn test_sequential_mode_takes_lowest_index() {
        let mut rng = StepRng::new(3, 5);
        let mut picker = PiecePicker::new(&bitfield(&[0, 0, 0, 0]), true);
        let peer = bitfield(&[0, 1, 1, 1]);
        picker.register_availability(&peer);

        assert_eq!(picker.pick_piece(&peer, &mut rng), Some(1));
        assert_eq!(picker.pick_piece(&peer, &mut rng), Some(2));
        assert_eq!(picker.pick_piece(&peer, &mut rng), Some(3));
    }

    #[test]
    fn test_return_and_receive_lifecycle() {
        let mut rng = StepRng::new(0, 1);
        let mut picker = picker_with_own(&[1, 1, 1, 1, 0]);
        let peer = bitfield(&[1, 1, 1, 1, 1]);
        picker.register_availability(&peer);

        let picked = picker.pick_piece(&peer, &mut rng).unwrap();
        assert_eq!(picked, 4);

        // a failed verification returns it to the pool
        picker.return_piece(picked);
        assert_eq!(picker.pick_piece(&peer, &mut rng), Some(4));

        picker.received_piece(4);
        assert_eq!(picker.own_count(), 5);
        assert!(!picker.is_interesting(&peer));
        assert!(picker.all_missing_pending());
        assert_eq!(picker.pick_piece(&peer, &mut rng), None);
    }

    #[test]
    fn test_interest_tracks_haves() {
        let mut picker = picker_with_own(&[1, 0]);
        let peer = bitfield(&[1, 0]);
        assert!(!picker.is_interesting(&peer));
        assert!(picker.register_have(1));
        let peer = bitfield(&[1, 1]);
        assert!(picker.is_interesting(&peer));
    }
}
