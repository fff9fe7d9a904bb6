// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Destaging writes
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A write is validated, throttled, given buffer memory and dedicated log
// reservation, and then dispatched to the shared and dedicated logs
// concurrently. The two completions arrive in any order and are reconciled
// by `DestagingWrite::process_completion`:
//
// - The first success completes the caller, except for a truncate-tail
//   write, which completes only once both logs have finished.
// - A shared failure is never reported on its own; the dedicated result
//   decides. A shared failure other than log-full sends every later write
//   to the dedicated log only.
// - A dedicated failure fails the stream for every later write.
// - When both have finished the write leaves the outstanding table and the
//   shared log is truncated as far as is safe.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use verisim_logstore::{Asn, LogStream, ReadMode, SharedBuffer, Version, WriteRecord};

use crate::allocator::BufferPermit;
use crate::coalesce::CoalescedWrite;
use crate::error::{OverlayError, OverlayResult};
use crate::header::{rewrite_header, round_up_4k, LogicalLogHeader};
use crate::refs::RequestRef;
use crate::stats::StreamCounters;
use crate::stream::{OverlayStream, StreamLogs};
use crate::tables::{OutstandingWrite, TableKey};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A record to write through an overlay stream.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub asn: Asn,
    pub version: Version,
    /// Metadata buffer. For logical-log streams it starts with a
    /// [`LogicalLogHeader`].
    pub metadata: SharedBuffer,
    pub data: SharedBuffer,
    /// Dedicated log space the caller reserved earlier for this write.
    pub reservation: u64,
    /// Make the write, and anything coalesced before it, durable at once.
    pub force_flush: bool,
}

impl WriteRequest {
    pub fn new(asn: Asn, version: Version, metadata: SharedBuffer, data: SharedBuffer) -> Self {
        Self {
            asn,
            version,
            metadata,
            data,
            reservation: 0,
            force_flush: false,
        }
    }

    pub fn with_reservation(mut self, reservation: u64) -> Self {
        self.reservation = reservation;
        self
    }

    pub fn with_force_flush(mut self) -> Self {
        self.force_flush = true;
        self
    }
}

/// Result of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Whether the write was also sent to the shared log.
    pub sent_to_shared: bool,
    /// Dedicated log capacity.
    pub log_size: u64,
    /// Dedicated log space not yet written or reserved.
    pub space_remaining: u64,
}

/// A validated write, ready for dispatch.
#[derive(Debug)]
struct PreparedWrite {
    metadata: SharedBuffer,
    payload: Option<Vec<u8>>,
    application_bytes: u64,
    end_of_record: bool,
    truncate_tail: bool,
    tail_after: Asn,
}

impl PreparedWrite {
    fn plain(request: &WriteRequest) -> Self {
        Self {
            metadata: request.metadata.clone(),
            payload: None,
            application_bytes: (request.metadata.len() + request.data.len()) as u64,
            end_of_record: false,
            truncate_tail: false,
            tail_after: request.asn,
        }
    }
}

// ---------------------------------------------------------------------------
// DestagingWrite
// ---------------------------------------------------------------------------

/// One write in flight against the shared and dedicated logs.
struct DestagingWrite {
    stream: Arc<OverlayStream>,
    asn: Asn,
    version: Version,
    application_bytes: u64,
    end_of_record: bool,
    truncate_tail: bool,
    tail_after: Asn,
    sent_to_shared: bool,
    outstanding: AtomicU32,
    completed: AtomicBool,
    dedicated_result: Mutex<Option<OverlayResult<()>>>,
    caller: Mutex<Option<oneshot::Sender<OverlayResult<WriteOutcome>>>>,
    entry: Arc<OutstandingWrite>,
    key: TableKey,
    _request: RequestRef,
}

impl DestagingWrite {
    async fn run_shared(self: Arc<Self>, logs: Arc<StreamLogs>, record: WriteRecord) {
        let stream = &self.stream;
        if let Some(delay) = stream.write_delay(true) {
            tokio::time::sleep(delay).await;
        }

        let key = stream
            .shared_writes
            .add(OutstandingWrite::new(self.asn, self.version));
        let bytes = record.total_size();
        let started = Instant::now();
        let result = loop {
            match logs.shared.write(record.clone()).await {
                Err(err)
                    if err.is_log_full()
                        && !self.completed.load(Ordering::Acquire)
                        && !stream.request_refs().is_closing() =>
                {
                    debug!(
                        stream_id = %stream.stream_id,
                        asn = self.asn,
                        version = self.version,
                        "Shared log full; retrying write"
                    );
                    stream.set_last_shared_status(Some(err.into()));
                    tokio::time::sleep(stream.config.log_full_retry_delay()).await;
                }
                other => break other.map_err(OverlayError::from),
            }
        };
        stream.shared_writes.remove(key);

        match &result {
            Ok(()) => {
                stream.set_last_shared_status(None);
                stream.shared_latency.record(started.elapsed());
                StreamCounters::add(&stream.counters.shared_bytes_written, bytes);
            }
            Err(err) => stream.set_last_shared_status(Some(err.clone())),
        }
        self.process_completion(true, result).await;
    }

    async fn run_dedicated(
        self: Arc<Self>,
        logs: Arc<StreamLogs>,
        record: WriteRecord,
        payload: Option<Vec<u8>>,
        permit: Option<BufferPermit>,
    ) {
        let stream = self.stream.clone();
        if let Some(delay) = stream.write_delay(false) {
            tokio::time::sleep(delay).await;
        }

        let bytes = record.total_size();
        let force_flush = record.force_flush;
        stream.throttle.add_outstanding(bytes);
        let started = Instant::now();

        let result = match (stream.coalescer(&logs), payload) {
            (Some(coalescer), Some(payload)) => {
                let pending = coalescer
                    .append(CoalescedWrite {
                        asn: self.asn,
                        version: self.version,
                        payload,
                        end_of_record: self.end_of_record,
                        reservation: record.reservation,
                        permit,
                    })
                    .await;
                if !self.sent_to_shared
                    || self.truncate_tail
                    || force_flush
                    || stream.is_under_pressure_to_flush()
                {
                    // The flush result reaches this write through `pending`.
                    let _ = coalescer.flush().await;
                }
                pending.await.unwrap_or(Err(OverlayError::Cancelled))
            }
            _ => logs.dedicated.write(record).await.map_err(OverlayError::from),
        };

        stream.throttle.sub_outstanding(bytes);
        if result.is_ok() {
            StreamCounters::add(&stream.counters.dedicated_bytes_written, bytes);
            stream.dedicated_latency.record(started.elapsed());
            stream.raise_shared_truncation(self.asn, self.version);
        }
        stream.throttle.unthrottle_if_possible();

        self.process_completion(false, result).await;

        if let Some(point) = self.entry.take_truncation_pending() {
            debug!(
                stream_id = %stream.stream_id,
                asn = self.asn,
                point,
                "Applying deferred truncation"
            );
            if let Err(err) = stream.truncate(point).await {
                debug!(stream_id = %stream.stream_id, point, error = %err, "Deferred truncation skipped");
            }
        }
    }

    fn dedicated_result(&self) -> Option<OverlayResult<()>> {
        lock(&self.dedicated_result).clone()
    }

    /// Reconcile one log's completion with the caller.
    async fn process_completion(&self, from_shared: bool, status: OverlayResult<()>) {
        let stream = &self.stream;
        let remaining = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        match &status {
            Err(err) if from_shared && !err.is_log_full() => stream.degrade_to_dedicated_only(err),
            _ => {}
        }
        if !from_shared {
            *lock(&self.dedicated_result) = Some(status.clone());
        }

        // A shared failure waits for the dedicated result; a truncate-tail
        // write waits for both logs.
        let wait_for_other = remaining == 1
            && ((from_shared && status.is_err()) || (status.is_ok() && self.truncate_tail));

        if !wait_for_other {
            let outcome = match status {
                Ok(()) => Ok(()),
                Err(err) if from_shared => self.dedicated_result().unwrap_or(Err(err)),
                Err(err) => {
                    stream.set_failure_status(err.clone());
                    Err(err)
                }
            };

            if outcome.is_ok()
                && remaining == 0
                && self.truncate_tail
                && stream.is_logical()
                && stream.failure_status().is_none()
            {
                self.delete_tail_truncated_records().await;
            }

            let already_completed = self.completed.swap(true, Ordering::AcqRel);
            if !already_completed {
                match outcome {
                    Ok(()) => {
                        if stream.is_logical() {
                            if self.end_of_record {
                                stream.set_tail(self.tail_after);
                            } else {
                                stream.set_tail_if_larger(self.tail_after);
                            }
                            stream.set_last_version_if_larger(self.version);
                        }
                        StreamCounters::add(
                            &stream.counters.application_bytes_written,
                            self.application_bytes,
                        );
                        let usage = stream.log_usage().await.unwrap_or_default();
                        self.complete_caller(Ok(WriteOutcome {
                            sent_to_shared: self.sent_to_shared,
                            log_size: usage.log_size,
                            space_remaining: usage.space_remaining,
                        }));
                    }
                    Err(err) => {
                        warn!(
                            stream_id = %stream.stream_id,
                            asn = self.asn,
                            version = self.version,
                            error = %err,
                            "Write failed"
                        );
                        self.complete_caller(Err(err));
                    }
                }
            }
        }

        if remaining == 0 {
            stream.dedicated_writes.remove(self.key);
            if stream.failure_status().is_none() {
                let (asn, version) = stream.shared_truncation_point();
                stream.truncate_shared_if_possible(asn, version).await;
                stream.check_thresholds().await;
            }
            stream.backlog.should_unthrottle(false).await;
        }
    }

    fn complete_caller(&self, result: OverlayResult<WriteOutcome>) {
        if let Some(caller) = lock(&self.caller).take() {
            // The caller may have stopped waiting.
            let _ = caller.send(result);
        }
    }

    /// Remove records a truncate-tail write superseded from both logs.
    async fn delete_tail_truncated_records(&self) {
        let stream = &self.stream;
        let Ok(logs) = stream.logs() else {
            return;
        };
        let shared: &dyn LogStream = logs.shared.as_ref();
        let dedicated: &dyn LogStream = logs.dedicated.as_ref();
        for log in [shared, dedicated] {
            let mut cursor = self.asn;
            loop {
                let next = match log.query_record(cursor, ReadMode::NextFromSpecificAsn).await {
                    Ok(info) if !info.is_none() => info,
                    Ok(_) => break,
                    Err(err) => {
                        warn!(stream_id = %stream.stream_id, error = %err, "Tail scan failed");
                        break;
                    }
                };
                if next.is_persisted() && next.version < self.version {
                    if let Err(err) = log.delete_record(next.asn, next.version).await {
                        debug!(
                            stream_id = %stream.stream_id,
                            asn = next.asn,
                            error = %err,
                            "Tail record already gone"
                        );
                    }
                }
                cursor = next.asn;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OverlayStream write path
// ---------------------------------------------------------------------------

impl OverlayStream {
    /// Write a record to the shared and dedicated logs.
    ///
    /// Resolves once the write is durable in at least one log, or in both
    /// for a truncate-tail write.
    pub async fn write(self: &Arc<Self>, request: WriteRequest) -> OverlayResult<WriteOutcome> {
        let guard = self.request_refs().try_acquire()?;
        if let Some(err) = self.failure_status() {
            return Err(OverlayError::StreamFailed(Box::new(err)));
        }
        let logs = self.logs()?;

        let prepared = if self.is_logical() {
            self.validate_logical_write(&request).inspect_err(|err| {
                warn!(
                    stream_id = %self.stream_id,
                    asn = request.asn,
                    version = request.version,
                    error = %err,
                    "Rejected logical log write"
                );
            })?
        } else {
            PreparedWrite::plain(&request)
        };

        self.throttle_write_if_needed().await?;

        let permit = match (&prepared.payload, self.coalescer(&logs)) {
            (Some(payload), Some(_)) => Some(self.allocator.allocate(payload.len() as u64).await?),
            _ => None,
        };

        let needed = request.data.len() as u64 + round_up_4k(prepared.metadata.len() as u64);
        let reserved_here = needed.saturating_sub(request.reservation);
        if reserved_here > 0 {
            logs.dedicated.update_reservation(reserved_here as i64).await?;
        }
        let reservation = needed.max(request.reservation);

        if prepared.truncate_tail {
            if let Some(coalescer) = self.coalescer(&logs) {
                if let Err(err) = coalescer.flush().await {
                    if reserved_here > 0 {
                        if let Err(release_err) =
                            logs.dedicated.update_reservation(-(reserved_here as i64)).await
                        {
                            warn!(
                                stream_id = %self.stream_id,
                                error = %release_err,
                                "Failed to release write reservation"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        let record_size = (prepared.metadata.len() + request.data.len()) as u64;
        let sent_to_shared = self.should_send_to_shared(&prepared, request.asn, record_size);
        let entry = OutstandingWrite::new(request.asn, request.version);
        let key = self.dedicated_writes.add(entry.clone());

        debug!(
            stream_id = %self.stream_id,
            asn = request.asn,
            version = request.version,
            sent_to_shared,
            truncate_tail = prepared.truncate_tail,
            "Dispatching write"
        );

        let (tx, rx) = oneshot::channel();
        let write = Arc::new(DestagingWrite {
            stream: self.clone(),
            asn: request.asn,
            version: request.version,
            application_bytes: prepared.application_bytes,
            end_of_record: prepared.end_of_record,
            truncate_tail: prepared.truncate_tail,
            tail_after: prepared.tail_after,
            sent_to_shared,
            outstanding: AtomicU32::new(if sent_to_shared { 2 } else { 1 }),
            completed: AtomicBool::new(false),
            dedicated_result: Mutex::new(None),
            caller: Mutex::new(Some(tx)),
            entry,
            key,
            _request: guard,
        });

        let dedicated_record = WriteRecord {
            reservation,
            asn: request.asn,
            version: request.version,
            metadata: prepared.metadata.clone(),
            data: request.data.clone(),
            force_flush: request.force_flush,
        };
        if sent_to_shared {
            let shared_record = WriteRecord {
                reservation: 0,
                ..dedicated_record.clone()
            };
            tokio::spawn(write.clone().run_shared(logs.clone(), shared_record));
        }
        tokio::spawn(write.run_dedicated(logs, dedicated_record, prepared.payload, permit));

        rx.await.unwrap_or(Err(OverlayError::Cancelled))
    }

    /// Check a logical-log write against the stream's sequence and tail.
    fn validate_logical_write(&self, request: &WriteRequest) -> OverlayResult<PreparedWrite> {
        let last_version = self.last_version();
        let tail = self.logical_tail();
        let out_of_sequence = || OverlayError::OutOfSequence {
            asn: request.asn,
            version: request.version,
            expected: last_version + 1,
        };

        if request.version != last_version + 1 {
            return Err(out_of_sequence());
        }

        let mut header = LogicalLogHeader::parse(&request.metadata)?;
        if header.stream_id != self.stream_id {
            return Err(OverlayError::InvalidHeader(format!(
                "stream id {} does not match stream {}",
                header.stream_id, self.stream_id
            )));
        }
        if header.stream_offset != request.asn {
            return Err(OverlayError::InvalidHeader(format!(
                "stream offset {} does not match asn {}",
                header.stream_offset, request.asn
            )));
        }
        if header.highest_operation_id != request.version {
            return Err(OverlayError::InvalidHeader(format!(
                "highest operation id {} does not match version {}",
                header.highest_operation_id, request.version
            )));
        }
        let payload = header.payload(&request.metadata, &request.data)?;
        header.verify_data(&request.metadata, &request.data)?;

        if request.asn > tail {
            return Err(out_of_sequence());
        }

        let end_of_record = header.is_end_of_record();
        let metadata = if end_of_record {
            header.mark_record_end(header.data_size);
            rewrite_header(&request.metadata, &header)
        } else {
            request.metadata.clone()
        };

        let mut truncate_tail = self.next_record_first_write.load(Ordering::Acquire);
        if request.asn < tail {
            if !end_of_record {
                return Err(OverlayError::InvalidParameter(format!(
                    "write at asn {} below tail {} must end a record",
                    request.asn, tail
                )));
            }
            truncate_tail = true;
        }
        if truncate_tail {
            self.next_record_first_write.store(false, Ordering::Release);
        }

        Ok(PreparedWrite {
            metadata,
            application_bytes: payload.len() as u64,
            tail_after: request.asn + u64::from(header.data_size),
            payload: Some(payload),
            end_of_record,
            truncate_tail,
        })
    }

    /// Wait while the shared log backlog or this stream's dedicated bytes
    /// outstanding hold writes back.
    async fn throttle_write_if_needed(&self) -> OverlayResult<()> {
        if let Some(released) = self.backlog.should_throttle().await {
            debug!(stream_id = %self.stream_id, "Write throttled on shared log backlog");
            released.await.map_err(|_| OverlayError::Cancelled)?;
            return Ok(());
        }
        if let Some(released) = self.throttle.should_throttle() {
            debug!(
                stream_id = %self.stream_id,
                bytes_outstanding = self.throttle.bytes_outstanding(),
                threshold = self.throttle.threshold(),
                "Write throttled on dedicated bytes outstanding"
            );
            released.await.map_err(|_| OverlayError::Cancelled)?;
        }
        Ok(())
    }

    fn should_send_to_shared(&self, prepared: &PreparedWrite, asn: Asn, record_size: u64) -> bool {
        if self.is_write_only_to_dedicated() {
            return false;
        }
        if prepared.truncate_tail {
            return true;
        }
        let (shared_truncation_asn, _) = self.shared_truncation_point();
        if asn <= shared_truncation_asn {
            return false;
        }
        record_size <= self.shared_container.max_record_size()
    }
}
