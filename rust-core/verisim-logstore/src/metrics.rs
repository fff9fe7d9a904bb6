// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Metrics-collecting wrapper for VeriSimDB log streams.
//
// Wraps any `LogStream` and transparently collects operation counts, latency
// sums and byte totals. The overlay engine reports these numbers through its
// telemetry query.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use crate::error::LogStoreResult;
use crate::stream::LogStream;
use crate::types::{
    Asn, LogRecord, LogStreamType, ReadMode, RecordInfo, RecordRange, StreamId, Version,
    WriteRecord,
};

/// Accumulated statistics for a log stream.
///
/// All counters are monotonically increasing for the lifetime of the
/// [`MetricsLogStream`] that owns them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStreamStats {
    /// Number of `read` calls.
    pub read_count: u64,
    /// Number of `write` calls.
    pub write_count: u64,
    /// Number of `write` calls that failed.
    pub write_failures: u64,
    /// Number of `truncate` and `truncate_below_version` calls.
    pub truncate_count: u64,
    /// Cumulative wall-clock latency of all reads, in milliseconds.
    pub read_latency_sum_ms: f64,
    /// Cumulative wall-clock latency of all writes, in milliseconds.
    pub write_latency_sum_ms: f64,
    /// Total bytes returned by successful reads.
    pub bytes_read: u64,
    /// Total bytes accepted by successful writes.
    pub bytes_written: u64,
}

/// A log stream wrapper that collects operation metrics.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use verisim_logstore::memory::InMemoryLogStream;
/// use verisim_logstore::metrics::MetricsLogStream;
/// use verisim_logstore::stream::LogStream;
/// use verisim_logstore::types::{LogStreamType, StreamId, WriteRecord};
///
/// # tokio_test::block_on(async {
/// let inner = Arc::new(InMemoryLogStream::standalone(StreamId::new_v4(), LogStreamType::Plain, 4096));
/// let metered = MetricsLogStream::new(inner);
///
/// let record = WriteRecord::new(1, 1, Arc::from(vec![0u8; 8]), Arc::from(vec![0u8; 24]));
/// metered.write(record).await.unwrap();
///
/// let stats = metered.stats().await;
/// assert_eq!(stats.write_count, 1);
/// assert_eq!(stats.bytes_written, 32);
/// # });
/// ```
pub struct MetricsLogStream {
    inner: Arc<dyn LogStream>,
    stats: RwLock<LogStreamStats>,
}

impl MetricsLogStream {
    /// Wrap `inner` with metrics collection.
    pub fn new(inner: Arc<dyn LogStream>) -> Self {
        Self {
            inner,
            stats: RwLock::new(LogStreamStats::default()),
        }
    }

    /// Return a snapshot of the current statistics.
    pub async fn stats(&self) -> LogStreamStats {
        self.stats.read().await.clone()
    }

    /// Reset all statistics to zero.
    pub async fn reset_stats(&self) {
        *self.stats.write().await = LogStreamStats::default();
    }

    /// The wrapped stream.
    pub fn inner(&self) -> &Arc<dyn LogStream> {
        &self.inner
    }
}

#[async_trait]
impl LogStream for MetricsLogStream {
    fn stream_id(&self) -> StreamId {
        self.inner.stream_id()
    }

    fn stream_type(&self) -> LogStreamType {
        self.inner.stream_type()
    }

    async fn query_record_range(&self) -> LogStoreResult<RecordRange> {
        self.inner.query_record_range().await
    }

    async fn query_record(&self, asn: Asn, mode: ReadMode) -> LogStoreResult<RecordInfo> {
        self.inner.query_record(asn, mode).await
    }

    async fn query_records(&self, low: Asn, high: Asn) -> LogStoreResult<Vec<RecordInfo>> {
        self.inner.query_records(low, high).await
    }

    async fn read(&self, asn: Asn, mode: ReadMode) -> LogStoreResult<LogRecord> {
        let start = Instant::now();
        let result = self.inner.read(asn, mode).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut s = self.stats.write().await;
        s.read_count += 1;
        s.read_latency_sum_ms += elapsed_ms;
        if let Ok(ref record) = result {
            s.bytes_read += record.total_size();
        }

        result
    }

    async fn write(&self, record: WriteRecord) -> LogStoreResult<()> {
        let size = record.total_size();
        let start = Instant::now();
        let result = self.inner.write(record).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut s = self.stats.write().await;
        s.write_count += 1;
        s.write_latency_sum_ms += elapsed_ms;
        match result {
            Ok(()) => s.bytes_written += size,
            Err(_) => s.write_failures += 1,
        }

        result
    }

    async fn truncate(&self, asn: Asn, preferred: Asn) -> LogStoreResult<()> {
        self.stats.write().await.truncate_count += 1;
        self.inner.truncate(asn, preferred).await
    }

    async fn truncate_below_version(&self, asn: Asn, version: Version) -> LogStoreResult<()> {
        self.stats.write().await.truncate_count += 1;
        self.inner.truncate_below_version(asn, version).await
    }

    async fn delete_record(&self, asn: Asn, version: Version) -> LogStoreResult<()> {
        self.inner.delete_record(asn, version).await
    }

    async fn update_reservation(&self, delta: i64) -> LogStoreResult<()> {
        self.inner.update_reservation(delta).await
    }

    async fn reservation_space(&self) -> u64 {
        self.inner.reservation_space().await
    }

    async fn set_truncation_completion_event(&self, event: Option<Arc<Notify>>) {
        self.inner.set_truncation_completion_event(event).await
    }

    async fn write_metadata(&self, block: Vec<u8>) -> LogStoreResult<()> {
        self.inner.write_metadata(block).await
    }

    async fn read_metadata(&self) -> LogStoreResult<Vec<u8>> {
        self.inner.read_metadata().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogStoreError;
    use crate::memory::InMemoryLogStream;

    fn metered() -> (Arc<InMemoryLogStream>, MetricsLogStream) {
        let inner = Arc::new(InMemoryLogStream::standalone(
            StreamId::new_v4(),
            LogStreamType::Plain,
            4096,
        ));
        let wrapped = MetricsLogStream::new(inner.clone());
        (inner, wrapped)
    }

    fn record(asn: Asn) -> WriteRecord {
        WriteRecord::new(asn, asn, Arc::from(vec![0u8; 4]), Arc::from(vec![1u8; 12]))
    }

    #[tokio::test]
    async fn test_counts_reads_and_writes() {
        let (_, m) = metered();
        m.write(record(1)).await.unwrap();
        m.write(record(2)).await.unwrap();
        m.read(1, ReadMode::Exact).await.unwrap();

        let stats = m.stats().await;
        assert_eq!(stats.write_count, 2);
        assert_eq!(stats.read_count, 1);
        assert_eq!(stats.bytes_written, 32);
        assert_eq!(stats.bytes_read, 16);
    }

    #[tokio::test]
    async fn test_counts_failures() {
        let (inner, m) = metered();
        inner
            .fail_next_writes(LogStoreError::BackendUnavailable("disk".into()), 1)
            .await;
        assert!(m.write(record(1)).await.is_err());

        let stats = m.stats().await;
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let (_, m) = metered();
        m.write(record(1)).await.unwrap();
        m.truncate(1, 1).await.unwrap();
        assert_eq!(m.stats().await.truncate_count, 1);
        m.reset_stats().await;
        assert_eq!(m.stats().await.write_count, 0);
    }
}
