//! Monotonic checkpoints
//!
//! A [`Checkpoint`] remembers when it was last reset and answers
//! "have at least N seconds passed since then". Built on
//! `tokio::time::Instant` so tests can drive it with a paused clock.

use std::time::Duration;

use tokio::time::Instant;

/// A captured point in time
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    at: Instant,
}

impl Checkpoint {
    /// Create a checkpoint at the current instant
    pub fn new() -> Self {
        Self { at: Instant::now() }
    }

    /// Move the checkpoint to the current instant
    pub fn reset(&mut self) {
        self.at = Instant::now();
    }

    /// True once at least `secs` seconds have passed since the last reset
    pub fn elapsed(&self, secs: u64) -> bool {
        self.elapsed_for(Duration::from_secs(secs))
    }

    /// Duration flavour of [`Checkpoint::elapsed`]
    pub fn elapsed_for(&self, interval: Duration) -> bool {
        self.since() >= interval
    }

    /// Time passed since the last reset
    pub fn since(&self) -> Duration {
        Instant::now().saturating_duration_since(self.at)
    }

    /// The instant at which `interval` will have elapsed
    pub fn deadline(&self, interval: Duration) -> Instant {
        self.at + interval
    }

    /// The captured instant
    pub fn instant(&self) -> Instant {
        self.at
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}
