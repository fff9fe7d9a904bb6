// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Overlay stream
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// An overlay stream presents one logical stream backed by two physical logs:
// a shared log multiplexed across many streams for low write latency, and a
// dedicated log owned by this stream that is the authoritative long-term
// store. Writes fan out to both; reads resolve whichever copy is
// authoritative; the shared copy is truncated once the dedicated copy is
// durable.
//
// This module holds the stream state and the helpers shared by the open,
// write, read, truncate and close paths, each of which lives in its own
// module as a further `impl OverlayStream` block.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use verisim_logstore::{
    Asn, LogContainer, LogFactory, LogStream, LogStreamType, MetricsLogStream, ReadMode,
    RecordInfo, RecordRange, StreamId, Version, ASN_MIN, ASN_NULL,
};

use crate::allocator::{StreamAllocation, ThrottledAllocator};
use crate::coalesce::CoalesceBuffer;
use crate::config::OverlayConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::header::LogicalLogHeader;
use crate::refs::RequestRefs;
use crate::stats::{LatencyTracker, StreamCounters, TelemetrySnapshot};
use crate::tables::OutstandingWrites;
use crate::threshold::ThresholdNotifications;
use crate::throttle::{SharedLogBacklog, WriteThrottle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Options and state
// ---------------------------------------------------------------------------

/// Parameters for creating an overlay stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayStreamOptions {
    pub stream_id: StreamId,
    pub stream_type: LogStreamType,
    /// Path of the dedicated container. When absent the container is
    /// located by the id derived from the stream id.
    pub dedicated_path: Option<String>,
    /// Capacity of the dedicated container in bytes.
    pub dedicated_size: u64,
    /// Largest record the stream accepts.
    pub max_record_size: u64,
}

/// Lifecycle of an overlay stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Constructed, never opened.
    Created,
    /// Open state machine running.
    Opening,
    /// Accepting requests.
    Opened,
    /// Close state machine running.
    Closing,
    /// Closed, or failed to open. May be opened again.
    Closed,
}

/// Physical log handles of an open stream.
pub(crate) struct StreamLogs {
    pub shared: Arc<MetricsLogStream>,
    pub dedicated: Arc<MetricsLogStream>,
    pub dedicated_container: Arc<dyn LogContainer>,
    pub coalescer: Option<Arc<CoalesceBuffer>>,
}

/// Dedicated log capacity as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogUsage {
    /// Total capacity in bytes.
    pub log_size: u64,
    /// Bytes neither written nor reserved.
    pub space_remaining: u64,
    /// Bytes held by records, reservations excluded.
    pub space_used: u64,
    /// `space_used` as a percentage of `log_size`.
    pub percent_used: u32,
}

// ---------------------------------------------------------------------------
// OverlayStream
// ---------------------------------------------------------------------------

/// One logical stream layered over a shared and a dedicated log.
pub struct OverlayStream {
    pub(crate) stream_id: StreamId,
    pub(crate) config: Arc<OverlayConfig>,
    pub(crate) shared_container: Arc<dyn LogContainer>,
    pub(crate) factory: Arc<dyn LogFactory>,
    pub(crate) backlog: Arc<SharedLogBacklog>,
    pub(crate) allocator: Arc<ThrottledAllocator>,
    pub(crate) open_gate: Arc<tokio::sync::Mutex<()>>,
    pub(crate) dedicated_path: Option<String>,

    pub(crate) refs: Mutex<Arc<RequestRefs>>,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) logical: AtomicBool,
    pub(crate) logs: RwLock<Option<Arc<StreamLogs>>>,

    pub(crate) shared_truncation: Mutex<(Asn, Version)>,
    pub(crate) tail: AtomicU64,
    pub(crate) last_version: AtomicU64,
    pub(crate) next_record_first_write: AtomicBool,
    pub(crate) recovered_header: Mutex<Option<LogicalLogHeader>>,

    pub(crate) write_only_to_dedicated: AtomicBool,
    pub(crate) coalescing_disabled: AtomicBool,
    pub(crate) shared_write_delay_ms: AtomicU64,
    pub(crate) dedicated_write_delay_ms: AtomicU64,

    pub(crate) failure: Mutex<Option<OverlayError>>,
    pub(crate) last_shared_status: Mutex<Option<OverlayError>>,

    pub(crate) dedicated_writes: OutstandingWrites,
    pub(crate) shared_writes: OutstandingWrites,
    pub(crate) throttle: WriteThrottle,
    pub(crate) shared_latency: LatencyTracker,
    pub(crate) dedicated_latency: LatencyTracker,
    pub(crate) counters: StreamCounters,
    pub(crate) thresholds: ThresholdNotifications,

    pub(crate) truncation_event: Arc<Notify>,
    pub(crate) background: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) allocation: Mutex<Option<StreamAllocation>>,
}

impl std::fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayStream")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state())
            .field("logical", &self.is_logical())
            .field("tail", &self.logical_tail())
            .field("last_version", &self.last_version())
            .finish_non_exhaustive()
    }
}

impl OverlayStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_id: StreamId,
        config: Arc<OverlayConfig>,
        shared_container: Arc<dyn LogContainer>,
        factory: Arc<dyn LogFactory>,
        backlog: Arc<SharedLogBacklog>,
        allocator: Arc<ThrottledAllocator>,
        open_gate: Arc<tokio::sync::Mutex<()>>,
        dedicated_path: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            shared_container,
            factory,
            backlog,
            allocator,
            open_gate,
            dedicated_path,
            refs: Mutex::new(RequestRefs::new()),
            state: Mutex::new(StreamState::Created),
            logical: AtomicBool::new(false),
            logs: RwLock::new(None),
            shared_truncation: Mutex::new((ASN_NULL, 0)),
            tail: AtomicU64::new(ASN_MIN),
            last_version: AtomicU64::new(0),
            next_record_first_write: AtomicBool::new(false),
            recovered_header: Mutex::new(None),
            write_only_to_dedicated: AtomicBool::new(config.write_only_to_dedicated),
            coalescing_disabled: AtomicBool::new(!config.coalescing_enabled),
            shared_write_delay_ms: AtomicU64::new(0),
            dedicated_write_delay_ms: AtomicU64::new(0),
            failure: Mutex::new(None),
            last_shared_status: Mutex::new(None),
            dedicated_writes: OutstandingWrites::new(),
            shared_writes: OutstandingWrites::new(),
            throttle: WriteThrottle::new(config.dedicated_write_throttle_threshold),
            shared_latency: LatencyTracker::new(config.latency_sample_count),
            dedicated_latency: LatencyTracker::new(config.latency_sample_count),
            counters: StreamCounters::default(),
            thresholds: ThresholdNotifications::new(),
            truncation_event: Arc::new(Notify::new()),
            background: Mutex::new(Vec::new()),
            allocation: Mutex::new(None),
            config,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
    }

    /// True for logical-log streams.
    pub fn is_logical(&self) -> bool {
        self.logical.load(Ordering::Acquire)
    }

    /// Offset just past the last valid logical-log byte.
    pub fn logical_tail(&self) -> Asn {
        self.tail.load(Ordering::Acquire)
    }

    /// Highest logical-log version accepted.
    pub fn last_version(&self) -> Version {
        self.last_version.load(Ordering::Acquire)
    }

    /// Header of the record the tail was recovered from at open, if any.
    pub fn recovered_header(&self) -> Option<LogicalLogHeader> {
        *lock(&self.recovered_header)
    }

    /// ASN and version below which the shared log may be truncated.
    pub fn shared_truncation_point(&self) -> (Asn, Version) {
        *lock(&self.shared_truncation)
    }

    /// The sticky dedicated-write failure, if one occurred.
    pub fn failure_status(&self) -> Option<OverlayError> {
        lock(&self.failure).clone()
    }

    /// True once the shared log is bypassed for new writes.
    pub fn is_write_only_to_dedicated(&self) -> bool {
        self.write_only_to_dedicated.load(Ordering::Acquire)
    }

    /// Dedicated writes currently in flight.
    pub fn outstanding_dedicated_writes(&self) -> usize {
        self.dedicated_writes.len()
    }

    /// Shared writes currently in flight.
    pub fn outstanding_shared_writes(&self) -> usize {
        self.shared_writes.len()
    }

    /// Lowest ASN among dedicated writes in flight, `ASN_MAX` when none.
    pub fn lowest_outstanding_dedicated_asn(&self) -> Asn {
        self.dedicated_writes.lowest_asn()
    }

    pub(crate) fn request_refs(&self) -> Arc<RequestRefs> {
        lock(&self.refs).clone()
    }

    pub(crate) fn logs(&self) -> OverlayResult<Arc<StreamLogs>> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(OverlayError::ObjectNoLongerExists)
    }

    pub(crate) fn install_logs(&self, logs: Option<Arc<StreamLogs>>) {
        *self.logs.write().unwrap_or_else(PoisonError::into_inner) = logs;
    }

    pub(crate) fn coalescer(&self, logs: &StreamLogs) -> Option<Arc<CoalesceBuffer>> {
        if self.coalescing_disabled.load(Ordering::Acquire) {
            return None;
        }
        logs.coalescer.clone()
    }

    pub(crate) fn spawn_background(&self, handle: JoinHandle<()>) {
        lock(&self.background).push(handle);
    }

    pub(crate) fn write_delay(&self, to_shared: bool) -> Option<Duration> {
        let millis = if to_shared {
            self.shared_write_delay_ms.load(Ordering::Acquire)
        } else {
            self.dedicated_write_delay_ms.load(Ordering::Acquire)
        };
        (millis > 0).then(|| Duration::from_millis(millis))
    }

    // -----------------------------------------------------------------------
    // Status tracking
    // -----------------------------------------------------------------------

    /// Latch the first dedicated write failure. Later writes fail fast.
    pub(crate) fn set_failure_status(&self, err: OverlayError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            error!(
                stream_id = %self.stream_id,
                error = %err,
                "Dedicated log write failed; stream no longer accepts writes"
            );
            *failure = Some(err);
        }
    }

    pub(crate) fn set_last_shared_status(&self, status: Option<OverlayError>) {
        *lock(&self.last_shared_status) = status;
    }

    pub(crate) fn last_shared_status(&self) -> Option<OverlayError> {
        lock(&self.last_shared_status).clone()
    }

    /// Stop sending new writes to the shared log.
    pub(crate) fn degrade_to_dedicated_only(&self, cause: &OverlayError) {
        if !self.write_only_to_dedicated.swap(true, Ordering::AcqRel) {
            warn!(
                stream_id = %self.stream_id,
                error = %cause,
                "Shared log write failed; writing only to dedicated log"
            );
        }
    }

    pub(crate) fn set_tail(&self, tail: Asn) {
        self.tail.store(tail, Ordering::Release);
    }

    pub(crate) fn set_tail_if_larger(&self, tail: Asn) {
        self.tail.fetch_max(tail, Ordering::AcqRel);
    }

    pub(crate) fn set_last_version_if_larger(&self, version: Version) {
        self.last_version.fetch_max(version, Ordering::AcqRel);
    }

    /// Raise the shared truncation point. Each half only moves forward.
    pub(crate) fn raise_shared_truncation(&self, asn: Asn, version: Version) {
        let mut point = lock(&self.shared_truncation);
        point.0 = point.0.max(asn);
        point.1 = point.1.max(version);
    }

    /// Replace the shared truncation ASN, returning the previous one.
    pub(crate) fn replace_shared_truncation_asn(&self, asn: Asn) -> Asn {
        let mut point = lock(&self.shared_truncation);
        std::mem::replace(&mut point.0, asn)
    }

    /// True when buffered writes should be flushed without waiting.
    pub fn is_under_pressure_to_flush(&self) -> bool {
        self.allocator.is_under_memory_pressure()
            || self
                .last_shared_status()
                .is_some_and(|status| status.is_log_full())
            || self.backlog.waiting_count() > 0
    }

    // -----------------------------------------------------------------------
    // Shared log truncation
    // -----------------------------------------------------------------------

    /// Truncate the shared log up to `desired` when no dedicated write is
    /// still in flight at or below it.
    pub(crate) async fn truncate_shared_if_possible(&self, desired: Asn, version: Version) {
        if self
            .last_shared_status()
            .is_some_and(|status| status.is_structure_fault())
        {
            return;
        }

        let must_stay_below = self.dedicated_writes.lowest_asn();
        let (shared_truncation_asn, _) = self.shared_truncation_point();
        if desired >= must_stay_below || desired > shared_truncation_asn {
            debug!(
                stream_id = %self.stream_id,
                desired,
                must_stay_below,
                shared_truncation_asn,
                "Shared log truncation deferred"
            );
            return;
        }

        let Ok(logs) = self.logs() else {
            return;
        };
        if let Err(err) = logs.shared.truncate_below_version(desired, version).await {
            warn!(
                stream_id = %self.stream_id,
                asn = desired,
                version,
                error = %err,
                "Shared log truncation failed"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Queries across both logs
    // -----------------------------------------------------------------------

    /// Combined ASN range of the shared and dedicated logs.
    pub async fn query_record_range(&self) -> OverlayResult<RecordRange> {
        let guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        let shared = logs.shared.query_record_range().await?;
        let dedicated = logs.dedicated.query_record_range().await?;
        drop(guard);
        Ok(merge_ranges(&shared, &dedicated))
    }

    /// Look up a record in both logs and report the authoritative one.
    pub async fn query_record(&self, asn: Asn, mode: ReadMode) -> OverlayResult<RecordInfo> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        let shared = logs.shared.query_record(asn, mode).await?;
        let dedicated = logs.dedicated.query_record(asn, mode).await?;
        Ok(merge_record_info(shared, dedicated))
    }

    /// Every record in `[low, high]` across both logs, one entry per ASN.
    pub async fn query_records(&self, low: Asn, high: Asn) -> OverlayResult<Vec<RecordInfo>> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        let shared = logs.shared.query_records(low, high).await?;
        let dedicated = logs.dedicated.query_records(low, high).await?;
        Ok(merge_record_lists(shared, dedicated))
    }

    /// Dedicated log capacity with reservations excluded from usage.
    pub async fn log_usage(&self) -> OverlayResult<LogUsage> {
        let logs = self.logs()?;
        let space = logs.dedicated_container.space_info().await;
        let reserved = logs.dedicated.reservation_space().await;
        let space_used = space.total.saturating_sub(space.free).saturating_sub(reserved);
        let percent_used = if space.total == 0 {
            0
        } else {
            (u128::from(space_used) * 100 / u128::from(space.total)) as u32
        };
        Ok(LogUsage {
            log_size: space.total,
            space_remaining: space.free,
            space_used,
            percent_used,
        })
    }

    /// Register for a one-shot notification once dedicated log usage
    /// reaches `percent`.
    pub async fn register_threshold(
        &self,
        percent: u32,
    ) -> OverlayResult<tokio::sync::oneshot::Receiver<u32>> {
        let _guard = self.request_refs().try_acquire()?;
        let receiver = self.thresholds.register(percent)?;
        self.check_thresholds().await;
        Ok(receiver)
    }

    pub(crate) async fn check_thresholds(&self) {
        if self.thresholds.is_empty() {
            return;
        }
        match self.log_usage().await {
            Ok(usage) => {
                self.thresholds.check(usage.percent_used);
            }
            Err(err) => debug!(stream_id = %self.stream_id, error = %err, "Usage unavailable"),
        }
    }

    /// Point-in-time telemetry counters.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            captured_at: chrono::Utc::now(),
            dedicated_bytes_outstanding: self.throttle.bytes_outstanding(),
            dedicated_write_throttle_threshold: self.throttle.threshold(),
            application_bytes_written: self
                .counters
                .application_bytes_written
                .load(Ordering::Relaxed),
            shared_bytes_written: self.counters.shared_bytes_written.load(Ordering::Relaxed),
            dedicated_bytes_written: self
                .counters
                .dedicated_bytes_written
                .load(Ordering::Relaxed),
            shared_write_latency_micros: self.shared_latency.average_micros(),
            dedicated_write_latency_micros: self.dedicated_latency.average_micros(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

/// Lowest of the non-empty lows, highest of the highs, and the dedicated
/// log's truncation point.
pub(crate) fn merge_ranges(shared: &RecordRange, dedicated: &RecordRange) -> RecordRange {
    let low = match (shared.is_empty(), dedicated.is_empty()) {
        (true, _) => dedicated.low,
        (false, true) => shared.low,
        (false, false) => shared.low.min(dedicated.low),
    };
    let high = match (shared.is_empty(), dedicated.is_empty()) {
        (true, _) => dedicated.high,
        (false, true) => shared.high,
        (false, false) => shared.high.max(dedicated.high),
    };
    RecordRange {
        low,
        high,
        truncation: dedicated.truncation,
    }
}

/// Pick the authoritative answer from the two logs. At one ASN the higher
/// version wins and a tie goes to the dedicated log; across ASNs the lower
/// one wins; a persisted record beats a pending one.
pub(crate) fn merge_record_info(shared: RecordInfo, dedicated: RecordInfo) -> RecordInfo {
    match (shared.is_none(), dedicated.is_none()) {
        (true, _) => dedicated,
        (false, true) => shared,
        (false, false) => {
            if shared.is_persisted() != dedicated.is_persisted() {
                return if dedicated.is_persisted() { dedicated } else { shared };
            }
            if shared.asn == dedicated.asn {
                if shared.version > dedicated.version {
                    shared
                } else {
                    dedicated
                }
            } else if shared.asn < dedicated.asn {
                shared
            } else {
                dedicated
            }
        }
    }
}

/// Merge two ASN-ordered record lists, keeping the higher version where
/// both logs hold the same ASN.
pub(crate) fn merge_record_lists(shared: Vec<RecordInfo>, dedicated: Vec<RecordInfo>) -> Vec<RecordInfo> {
    if shared.is_empty() {
        return dedicated;
    }
    if dedicated.is_empty() {
        return shared;
    }
    let mut merged: BTreeMap<Asn, RecordInfo> = BTreeMap::new();
    for info in dedicated {
        merged.insert(info.asn, info);
    }
    for info in shared {
        match merged.get(&info.asn) {
            Some(existing) if existing.version >= info.version => {}
            _ => {
                merged.insert(info.asn, info);
            }
        }
    }
    merged.into_values().collect()
}
