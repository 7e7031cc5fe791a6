//! Transfer speed accounting
//!
//! The engine keeps one upload and one download [`SpeedMeter`]; every peer
//! keeps its own pair for the choke policy.

use std::time::Duration;

use super::Checkpoint;

/// Length of a measuring window before it rolls over
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Byte-rate meter over a rolling window
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: Checkpoint,
    window_bytes: u64,
    last_rate: u64,
    total: u64,
}

impl SpeedMeter {
    /// Create an idle meter
    pub fn new() -> Self {
        Self {
            window: Checkpoint::new(),
            window_bytes: 0,
            last_rate: 0,
            total: 0,
        }
    }

    /// Account for `bytes` transferred now
    pub fn record(&mut self, bytes: u64) {
        if self.window.elapsed_for(SPEED_WINDOW) {
            self.last_rate = self.rate_in_window();
            self.window_bytes = 0;
            self.window.reset();
        }
        self.window_bytes += bytes;
        self.total += bytes;
    }

    /// Current rate in bytes per second
    pub fn speed(&self) -> u64 {
        if self.window.since() < Duration::from_secs(1) {
            self.last_rate
        } else {
            self.rate_in_window()
        }
    }

    /// Bytes recorded since creation
    pub fn total(&self) -> u64 {
        self.total
    }

    fn rate_in_window(&self) -> u64 {
        let secs = self.window.since().as_secs_f64();
        if secs <= 0.0 {
            return self.last_rate;
        }
        (self.window_bytes as f64 / secs) as u64
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine-wide transfer statistics
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    upload: SpeedMeter,
    download: SpeedMeter,
}

impl TransferStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record uploaded payload bytes
    pub fn add_uploaded(&mut self, bytes: u64) {
        if bytes > 0 {
            self.upload.record(bytes);
        }
    }

    /// Record downloaded payload bytes
    pub fn add_downloaded(&mut self, bytes: u64) {
        if bytes > 0 {
            self.download.record(bytes);
        }
    }

    /// Aggregate upload speed in bytes per second
    pub fn upload_speed(&self) -> u64 {
        self.upload.speed()
    }

    /// Aggregate download speed in bytes per second
    pub fn download_speed(&self) -> u64 {
        self.download.speed()
    }

    /// Total uploaded payload bytes
    pub fn uploaded(&self) -> u64 {
        self.upload.total()
    }

    /// Total downloaded payload bytes
    pub fn downloaded(&self) -> u64 {
        self.download.total()
    }
}
