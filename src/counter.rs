//! Byte counters with rolling rate estimates.
//!
//! Rates drive the choker's ranking and the adaptive request pipeline, so
//! they need to be smooth but responsive. Each counter keeps a lifetime
//! total and an exponentially weighted moving average over roughly a 20
//! second window, folded in once per stats tick (1 second).

/// The tick count over which a round's contribution to the average decays.
const WINDOW: f64 = 20.0;

/// A monotonically increasing byte counter with a rolling rate estimate.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {
    /// Records bytes for the current round.
    pub fn add(&mut self, bytes: u64) {
        self.round += bytes;
    }

    /// Closes the current round, folding it into the rolling average. Must
    /// be called once per second for the average to be a bytes/sec rate.
    pub fn tick(&mut self) {
        self.total += self.round;
        self.avg += (self.round as f64 - self.avg) / WINDOW;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
        self.round = 0;
    }

    /// The rolling bytes/sec average.
    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    /// The highest rolling average observed.
    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    /// All bytes ever recorded, including the still open round.
    pub fn total(&self) -> u64 {
        self.total + self.round
    }
}

/// The counters a torrent session and each of its peers keep.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounters {
    /// Payload bytes received.
    pub down: Counter,
    /// Payload bytes sent.
    pub up: Counter,
    /// Bytes that failed hash verification and had to be re-downloaded.
    pub waste: u64,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
    }
}
