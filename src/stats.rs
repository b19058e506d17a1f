//! Throughput tracking for the feed read loop

use std::time::Instant;

/// How many ticks between throughput log lines
const REPORT_EVERY: u64 = 5_000;

/// Counts processed ticks and yields the message rate once per window.
/// Single-owner; lives inside the feed manager's read loop.
#[derive(Debug)]
pub struct ThroughputMonitor {
    count: u64,
    window_start: Instant,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Record one processed tick. Returns the messages/second rate when a
    /// reporting window completes, resetting the window.
    pub fn record(&mut self) -> Option<f64> {
        self.count += 1;
        if self.count < REPORT_EVERY {
            return None;
        }

        let elapsed = self.window_start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.count as f64 / elapsed
        } else {
            0.0
        };

        self.count = 0;
        self.window_start = Instant::now();
        Some(rate)
    }
}

impl Default for ThroughputMonitor {
    fn default() -> Self {
        Self::new()
    }
}
