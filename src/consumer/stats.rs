//! In-memory consumer counters
//!
//! Owned and updated by the consumer loop only; everyone else reads
//! immutable `StatsSnapshot`s.

use std::time::Duration;
use tokio::time::Instant;

/// Counters since the loop started
#[derive(Debug)]
pub struct StatsTracker {
    started: Instant,
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    dead_lettered: u64,
    malformed: u64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages that reached a terminal outcome for one attempt
    pub processed: u64,
    /// Refreshes that succeeded
    pub succeeded: u64,
    /// Failed attempts, malformed payloads included
    pub failed: u64,
    /// Failed attempts pushed back to the main queue
    pub retried: u64,
    /// Messages pushed to the failed queue
    pub dead_lettered: u64,
    /// Payloads dropped because they did not decode
    pub malformed: u64,
    /// Time since the loop started
    pub uptime: Duration,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            dead_lettered: 0,
            malformed: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_retry(&mut self) {
        self.processed += 1;
        self.failed += 1;
        self.retried += 1;
    }

    pub fn record_dead_letter(&mut self) {
        self.processed += 1;
        self.failed += 1;
        self.dead_lettered += 1;
    }

    pub fn record_malformed(&mut self) {
        self.processed += 1;
        self.failed += 1;
        self.malformed += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            retried: self.retried,
            dead_lettered: self.dead_lettered,
            malformed: self.malformed,
            uptime: self.started.elapsed(),
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={}, succeeded={}, failed={}, uptime={:.0}s",
            self.processed,
            self.succeeded,
            self.failed,
            self.uptime.as_secs_f64()
        )
    }
}
