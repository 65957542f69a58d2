//! Token bucket rate shaping.
//!
//! Each torrent owns a bucket per direction and every session shares one
//! global bucket per direction. Buckets refill in continuous time rather
//! than on a tick. A transfer reserves its byte count against both its
//! torrent bucket and the global bucket and waits out the longer of the two
//! delays, which realizes "min(global share, per-torrent limit)": whichever
//! bucket is more depleted paces the transfer, and a torrent that doesn't
//! use its share leaves the global tokens for the others.
//!
//! The buckets are the only state shared across sessions (together with the
//! engine's session table); the critical section is token arithmetic only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// A continuous-time token bucket. `None` rate means unlimited.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Refill rate in bytes per second.
    rate: Option<u64>,
    /// The bucket capacity in bytes; also the starting balance.
    burst: u64,
    /// Current balance. Goes negative when reservations outpace the refill,
    /// which is what produces the delay.
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket with the burst defaulting to one second's worth of
    /// tokens.
    pub fn new(rate: Option<u64>) -> Self {
        let burst = rate.unwrap_or(0);
        Self {
            rate,
            burst,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return,
        };
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate as f64)
            .min(self.burst as f64);
        self.last_refill = now;
    }

    /// Returns the delay until `n` bytes may pass. Does not commit tokens.
    pub fn reserve(&mut self, n: u64, now: Instant) -> Duration {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return Duration::ZERO,
        };
        self.refill(now);
        let missing = n as f64 - self.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / rate as f64)
        }
    }

    /// Commits `n` bytes against the bucket. The balance may go negative;
    /// later reservations pay the debt off, so concurrent reservers can't
    /// exceed the R·T + B envelope.
    pub fn consume(&mut self, n: u64, now: Instant) {
        if self.rate.is_none() {
            return;
        }
        self.refill(now);
        self.tokens -= n as f64;
    }
}

/// A shareable bucket handle.
pub(crate) type SharedBucket = Arc<Mutex<TokenBucket>>;

pub(crate) fn shared(rate: Option<u64>) -> SharedBucket {
    Arc::new(Mutex::new(TokenBucket::new(rate)))
}

/// One direction of a torrent's shaping: its own bucket combined with the
/// engine-wide one.
#[derive(Clone)]
pub(crate) struct Limiter {
    torrent: SharedBucket,
    global: SharedBucket,
}

impl Limiter {
    pub fn new(torrent_rate: Option<u64>, global: SharedBucket) -> Self {
        Self {
            torrent: shared(torrent_rate),
            global,
        }
    }

    /// Commits `n` bytes against both buckets and waits out the longer
    /// reservation. The reserve-and-consume pair runs under each bucket's
    /// lock, so interleaved callers serialize their debt.
    pub async fn throttle(&self, n: u64) {
        let now = Instant::now();
        let delay = {
            let mut torrent = self.torrent.lock().expect("bucket poisoned");
            let delay = torrent.reserve(n, now);
            torrent.consume(n, now);
            delay
        }
        .max({
            let mut global = self.global.lock().expect("bucket poisoned");
            let delay = global.reserve(n, now);
            global.consume(n, now);
            delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
