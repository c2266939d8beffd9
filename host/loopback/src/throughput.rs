//! Session counters

use core::{fmt, time::Duration};
use std::time::Instant;

/// Running totals of a benchmark session
#[derive(Debug, Default)]
pub struct Throughput {
    bytes: u64,
    timeouts: u64,
    batches: u64,
    // captured at the first submission
    start: Option<Instant>,
}

impl Throughput {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock; later calls have no effect
    pub fn start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    /// Adds `n` verified (or, in the unidirectional modes, transferred) bytes
    pub fn record_bytes(&mut self, n: usize) {
        self.bytes += n as u64;
    }

    /// Counts a transfer that timed out
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    /// Counts a batch that was fully drained without being cancelled
    pub fn record_batch(&mut self) {
        self.batches += 1;
    }

    /// Total bytes so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Transfer timeouts so far
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Time since the first submission
    pub fn elapsed(&self) -> Duration {
        self.start.map(|start| start.elapsed()).unwrap_or_default()
    }

    /// Bits per second over `elapsed`
    pub fn report(&self, elapsed: Duration) -> f64 {
        bits_per_second(self.bytes, elapsed)
    }

    /// Freezes the counters into a report
    pub fn finish(&self, cancelled: bool) -> ThroughputReport {
        ThroughputReport {
            bytes_verified: self.bytes,
            timeouts: self.timeouts,
            batches: self.batches,
            elapsed: self.elapsed(),
            cancelled,
        }
    }
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0. {
        0.
    } else {
        (bytes * 8) as f64 / secs
    }
}

/// Outcome of a benchmark session
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThroughputReport {
    /// Bytes that made it through the pipeline; in loopback mode every one was verified
    pub bytes_verified: u64,
    /// Transfers that timed out
    pub timeouts: u64,
    /// Batches that were fully drained without being cancelled
    pub batches: u64,
    /// Time from the first submission to the end of the session
    pub elapsed: Duration,
    /// The session stopped because cancellation was requested
    pub cancelled: bool,
}

impl ThroughputReport {
    /// Aggregate bandwidth
    pub fn bits_per_second(&self) -> f64 {
        bits_per_second(self.bytes_verified, self.elapsed)
    }

    /// Aggregate bandwidth in kilobits (10^3) per second
    pub fn kbits_per_second(&self) -> f64 {
        self.bits_per_second() / 1_000.
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {:?} ({:.2} Kbps, {} batches, {} timeouts{})",
            self.bytes_verified,
            self.elapsed,
            self.kbits_per_second(),
            self.batches,
            self.timeouts,
            if self.cancelled { ", cancelled" } else { "" }
        )
    }
}
