//! The upload slot (choking) policy.
//!
//! Every regular tick the torrent ranks its interested peers by what they
//! are worth to us (their rolling download rate while we're leeching, our
//! upload rate to them while seeding) and unchokes the top slots. Every
//! optimistic tick one randomly chosen choked peer gets a probe slot,
//! displacing the weakest regular slot for the cycle, so fresh peers have a
//! chance to prove themselves. Peers that stopped delivering while unchoked
//! are snubbed and lose their regular slot until traffic resumes.
//!
//! The policy is pure: the torrent task feeds it a snapshot of candidates
//! taken at tick start and applies the returned transitions, sending exactly
//! one choke or unchoke frame per changed peer.

use std::net::SocketAddr;

use rand::{seq::SliceRandom, Rng};

/// A peer as the choker sees it, snapshotted at tick start.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChokeCandidate {
    pub addr: SocketAddr,
    /// Whether the remote wants our pieces. Only interested peers compete
    /// for slots.
    pub interested: bool,
    /// Whether we currently have the peer unchoked.
    pub unchoked: bool,
    /// The ranking rate: the peer's delivery rate to us while leeching, our
    /// rate to it while seeding.
    pub rate: u64,
    /// Whether the peer has sent nothing for the snub interval while
    /// unchoked.
    pub snubbed: bool,
}

/// The transitions a choke round decided on.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ChokeDecision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

pub(crate) struct Choker {
    /// The number of regular unchoke slots.
    slots: usize,
    /// The current optimistic unchoke, kept until the next rotation.
    optimistic: Option<SocketAddr>,
}

impl Choker {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            optimistic: None,
        }
    }

    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// Runs a choke round over the candidate snapshot. With
    /// `rotate_optimistic` set (the 30 second tick) a new optimistic peer is
    /// drawn from the choked and interested set first.
    pub fn run(
        &mut self,
        candidates: &[ChokeCandidate],
        rotate_optimistic: bool,
        rng: &mut impl Rng,
    ) -> ChokeDecision {
        // a departed or disinterested optimistic peer loses its slot
        if let Some(optimistic) = self.optimistic {
            if !candidates
                .iter()
                .any(|c| c.addr == optimistic && c.interested)
            {
                self.optimistic = None;
            }
        }

        if rotate_optimistic {
            let pool: Vec<SocketAddr> = candidates
                .iter()
                .filter(|c| c.interested && !c.unchoked)
                .map(|c| c.addr)
                .collect();
            if let Some(addr) = pool.choose(rng) {
                self.optimistic = Some(*addr);
            }
        }

        // rank the interested, unsnubbed peers; best first
        let mut ranked: Vec<&ChokeCandidate> = candidates
            .iter()
            .filter(|c| c.interested && !c.snubbed)
            .collect();
        ranked.sort_by(|a, b| b.rate.cmp(&a.rate));

        // the optimistic peer displaces the weakest regular slot
        let regular_slots = match self.optimistic {
            Some(optimistic)
                if !ranked[..self.slots.min(ranked.len())]
                    .iter()
                    .any(|c| c.addr == optimistic) =>
            {
                self.slots.saturating_sub(1)
            }
            _ => self.slots,
        };

        let mut desired: Vec<SocketAddr> = ranked
            .iter()
            .take(regular_slots)
            .map(|c| c.addr)
            .collect();
        if let Some(optimistic) = self.optimistic {
            if !desired.contains(&optimistic) {
                desired.push(optimistic);
            }
        }

        let mut decision = ChokeDecision::default();
        for candidate in candidates {
            let want_unchoked = desired.contains(&candidate.addr);
            if want_unchoked && !candidate.unchoked {
                decision.unchoke.push(candidate.addr);
            } else if !want_unchoked && candidate.unchoked {
                decision.choke.push(candidate.addr);
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 1], port).into()
    }

    fn candidate(port: u16, rate: u64, unchoked: bool) -> ChokeCandidate {
        ChokeCandidate {
            addr: addr(port),
            interested: true,
            unchoked,
            rate,
            snubbed: false,
        }
    }

    // the scenario of six interested peers competing for four slots
    #[test]
    fn test_regular_round_unchokes_top_four_by_rate() {
        let mut choker = Choker::new(4);
        let mut rng = StepRng::new(0, 1);
        let candidates = vec![
            candidate(1, 100, false),
            candidate(2, 600, false),
            candidate(3, 300, false),
            candidate(4, 500, false),
            candidate(5, 200, false),
            candidate(6, 400, false),
        ];

        let decision = choker.run(&candidates, false, &mut rng);
        let mut unchoked = decision.unchoke.clone();
        unchoked.sort();
        let mut expected = vec![addr(2), addr(3), addr(4), addr(6)];
        expected.sort();
        assert_eq!(unchoked, expected);
        assert!(decision.choke.is_empty());
    }

    #[test]
    fn test_optimistic_round_probes_a_choked_peer() {
        let mut choker = Choker::new(4);
        let mut rng = StepRng::new(0, 1);
        // the state after the regular round above
        let candidates = vec![
            candidate(1, 100, false),
            candidate(2, 600, true),
            candidate(3, 300, true),
            candidate(4, 500, true),
            candidate(5, 200, false),
            candidate(6, 400, true),
        ];

        let decision = choker.run(&candidates, true, &mut rng);
        let optimistic = choker.optimistic().expect("an optimistic pick");
        // drawn from the choked set
        assert!(optimistic == addr(1) || optimistic == addr(5));
        assert_eq!(decision.unchoke, vec![optimistic]);
        // the weakest regular slot (peer 3 at 300) makes room
        assert_eq!(decision.choke, vec![addr(3)]);

        // the count of unchoked peers never exceeds slots + 1
        let unchoked_after = candidates
            .iter()
            .filter(|c| c.unchoked && !decision.choke.contains(&c.addr))
            .count()
            + decision.unchoke.len();
        assert!(unchoked_after <= 4 + 1);
    }

    #[test]
    fn test_snubbed_peer_loses_its_slot() {
        let mut choker = Choker::new(2);
        let mut rng = StepRng::new(0, 1);
        let mut candidates = vec![
            candidate(1, 900, true),
            candidate(2, 800, true),
            candidate(3, 700, false),
        ];
        candidates[0].snubbed = true;

        let decision = choker.run(&candidates, false, &mut rng);
        assert_eq!(decision.choke, vec![addr(1)]);
        assert_eq!(decision.unchoke, vec![addr(3)]);
    }

    #[test]
    fn test_disinterested_peers_are_choked() {
        let mut choker = Choker::new(4);
        let mut rng = StepRng::new(0, 1);
        let mut candidates = vec![candidate(1, 900, true)];
        candidates[0].interested = false;

        let decision = choker.run(&candidates, false, &mut rng);
        assert_eq!(decision.choke, vec![addr(1)]);
        assert!(decision.unchoke.is_empty());
    }

    #[test]
    fn test_transitions_are_stable_across_repeat_rounds() {
        let mut choker = Choker::new(4);
        let mut rng = StepRng::new(0, 1);
        let candidates = vec![
            candidate(1, 100, false),
            candidate(2, 600, false),
        ];
        let first = choker.run(&candidates, false, &mut rng);
        assert_eq!(first.unchoke.len(), 2);

        // same snapshot with the transitions applied: nothing more to do
        let applied: Vec<ChokeCandidate> = candidates
            .iter()
            .map(|c| ChokeCandidate {
                unchoked: true,
                ..*c
            })
            .collect();
        let second = choker.run(&applied, false, &mut rng);
        assert_eq!(second, ChokeDecision::default());
    }
}
