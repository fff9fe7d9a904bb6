// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Stream statistics
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lock-free counters for write latency and byte totals. Concurrent updates
// may race on the reset of a latency window; that costs at most one sample
// and never corrupts a counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LatencyTracker
// ---------------------------------------------------------------------------

/// Running average of operation latency over fixed-size sample windows.
#[derive(Debug)]
pub struct LatencyTracker {
    sample_count: u64,
    total_micros: AtomicU64,
    intervals: AtomicU64,
    average_micros: AtomicU64,
}

impl LatencyTracker {
    /// Average over windows of `sample_count` samples.
    pub fn new(sample_count: u32) -> Self {
        Self {
            sample_count: u64::from(sample_count.max(1)),
            total_micros: AtomicU64::new(0),
            intervals: AtomicU64::new(0),
            average_micros: AtomicU64::new(0),
        }
    }

    /// Add one sample. Closes the window when it is full.
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        let total = self.total_micros.fetch_add(micros, Ordering::Relaxed) + micros;
        let intervals = self.intervals.fetch_add(1, Ordering::Relaxed) + 1;
        if intervals >= self.sample_count {
            self.average_micros
                .store(total / intervals, Ordering::Relaxed);
            self.total_micros.store(0, Ordering::Relaxed);
            self.intervals.store(0, Ordering::Relaxed);
        }
    }

    /// Average of the last closed window, in microseconds.
    pub fn average_micros(&self) -> u64 {
        self.average_micros.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// StreamCounters
// ---------------------------------------------------------------------------

/// Byte counters for one overlay stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Logical bytes the application wrote.
    pub application_bytes_written: AtomicU64,
    /// Bytes written to the shared log.
    pub shared_bytes_written: AtomicU64,
    /// Bytes written to the dedicated log.
    pub dedicated_bytes_written: AtomicU64,
}

impl StreamCounters {
    /// Add to a counter.
    pub fn add(counter: &AtomicU64, bytes: u64) {
        counter.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Point-in-time telemetry for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Dedicated write bytes currently in flight.
    pub dedicated_bytes_outstanding: u64,
    /// Dedicated write-throttle threshold.
    pub dedicated_write_throttle_threshold: u64,
    /// Logical bytes the application wrote.
    pub application_bytes_written: u64,
    /// Bytes written to the shared log.
    pub shared_bytes_written: u64,
    /// Bytes written to the dedicated log.
    pub dedicated_bytes_written: u64,
    /// Average shared write latency of the last window, in microseconds.
    pub shared_write_latency_micros: u64,
    /// Average dedicated write latency of the last window, in microseconds.
    pub dedicated_write_latency_micros: u64,
}
