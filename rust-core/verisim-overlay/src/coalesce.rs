// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Coalescing of logical-log writes
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Small logical-log writes are batched into one dedicated-log record. A batch
// accepts writes that continue exactly where it ends and fit in the buffer;
// anything else flushes the batch first. A flushed record carries the first
// ASN of the batch, its highest version, the combined payload, and a record
// marker just past the last write that ended a logical record. Every write in
// a batch completes with the result of the flush that carried it.
//
// Batches stay readable while they are open and while their flush is in
// flight, so a reader never falls into the gap between the buffer and the
// dedicated log.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use verisim_logstore::{Asn, LogRecord, LogStream, ReadMode, StreamId, Version, WriteRecord};

use crate::allocator::BufferPermit;
use crate::error::{OverlayError, OverlayResult};
use crate::header::{build_record, LogicalLogHeader, FLAG_END_OF_RECORD};

/// Completion of a coalesced write.
pub type FlushReceiver = oneshot::Receiver<OverlayResult<()>>;

/// One logical write handed to the coalescer.
#[derive(Debug)]
pub struct CoalescedWrite {
    pub asn: Asn,
    pub version: Version,
    /// Logical bytes of the write.
    pub payload: Vec<u8>,
    pub end_of_record: bool,
    /// Dedicated log reservation the write brings with it.
    pub reservation: u64,
    /// Buffer memory charged for the write, released with the batch.
    pub permit: Option<BufferPermit>,
}

#[derive(Debug)]
struct OpenBatch {
    first_asn: Asn,
    highest_version: Version,
    payload: Vec<u8>,
    record_end: Option<u32>,
    reservation: u64,
    opened_at: Instant,
    waiters: Vec<oneshot::Sender<OverlayResult<()>>>,
    permits: Vec<BufferPermit>,
}

impl OpenBatch {
    fn next_asn(&self) -> Asn {
        self.first_asn + self.payload.len() as u64
    }

    fn push(&mut self, write: CoalescedWrite, waiter: oneshot::Sender<OverlayResult<()>>) {
        self.highest_version = self.highest_version.max(write.version);
        self.payload.extend_from_slice(&write.payload);
        if write.end_of_record {
            self.record_end = Some(self.payload.len() as u32);
        }
        self.reservation += write.reservation;
        self.waiters.push(waiter);
        self.permits.extend(write.permit);
    }

    fn header(&self, stream_id: StreamId) -> LogicalLogHeader {
        let mut header = LogicalLogHeader::new(
            stream_id,
            self.first_asn,
            self.highest_version,
            &self.payload,
            false,
        );
        if let Some(end) = self.record_end {
            header.mark_record_end(end);
            if end as usize == self.payload.len() {
                header.flags |= FLAG_END_OF_RECORD;
            }
        }
        header
    }

    fn record(&self, stream_id: StreamId, fixed_metadata_size: u32) -> LogRecord {
        let (metadata, data) = build_record(&self.header(stream_id), &self.payload, fixed_metadata_size);
        LogRecord {
            asn: self.first_asn,
            version: self.highest_version,
            metadata,
            data,
        }
    }
}

/// A batch whose flush is in flight.
#[derive(Debug)]
struct SealedBatch {
    record: LogRecord,
    end_asn: Asn,
}

#[derive(Debug, Default)]
struct CoalesceState {
    open: Option<OpenBatch>,
    flushing: Vec<Arc<SealedBatch>>,
}

/// Batches logical-log writes into dedicated-log records.
pub struct CoalesceBuffer {
    stream_id: StreamId,
    dedicated: Arc<dyn LogStream>,
    capacity: usize,
    fixed_metadata_size: u32,
    state: Mutex<CoalesceState>,
    flush_order: tokio::sync::Mutex<()>,
}

impl CoalesceBuffer {
    /// A coalescer writing batches of at most `capacity` logical bytes to
    /// `dedicated`.
    pub fn new(
        stream_id: StreamId,
        dedicated: Arc<dyn LogStream>,
        capacity: usize,
        fixed_metadata_size: u32,
    ) -> Self {
        Self {
            stream_id,
            dedicated,
            capacity,
            fixed_metadata_size,
            state: Mutex::new(CoalesceState::default()),
            flush_order: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoalesceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `write` to the open batch, flushing the batch first if the
    /// write does not continue it or does not fit.
    pub async fn append(&self, write: CoalescedWrite) -> FlushReceiver {
        let (tx, rx) = oneshot::channel();
        let mut write = Some(write);
        loop {
            {
                let mut state = self.lock();
                let Some(pending) = write.take() else {
                    return rx;
                };
                match state.open.as_mut() {
                    None => {
                        let mut batch = OpenBatch {
                            first_asn: pending.asn,
                            highest_version: pending.version,
                            payload: Vec::with_capacity(self.capacity.min(pending.payload.len().max(4096))),
                            record_end: None,
                            reservation: 0,
                            opened_at: Instant::now(),
                            waiters: Vec::new(),
                            permits: Vec::new(),
                        };
                        batch.push(pending, tx);
                        state.open = Some(batch);
                        return rx;
                    }
                    Some(batch)
                        if batch.next_asn() == pending.asn
                            && batch.payload.len() + pending.payload.len() <= self.capacity =>
                    {
                        batch.push(pending, tx);
                        return rx;
                    }
                    Some(_) => write = Some(pending),
                }
            }
            // The flush result reaches the writes it carried.
            let _ = self.flush().await;
        }
    }

    /// Write the open batch to the dedicated log.
    pub async fn flush(&self) -> OverlayResult<()> {
        let _ordered = self.flush_order.lock().await;

        let (sealed, batch) = {
            let mut state = self.lock();
            let Some(batch) = state.open.take() else {
                return Ok(());
            };
            let sealed = Arc::new(SealedBatch {
                record: batch.record(self.stream_id, self.fixed_metadata_size),
                end_asn: batch.next_asn(),
            });
            state.flushing.push(sealed.clone());
            (sealed, batch)
        };

        let record = WriteRecord {
            reservation: batch.reservation,
            asn: sealed.record.asn,
            version: sealed.record.version,
            metadata: sealed.record.metadata.clone(),
            data: sealed.record.data.clone(),
            force_flush: true,
        };
        let result = self.dedicated.write(record).await.map_err(OverlayError::from);

        self.lock().flushing.retain(|in_flight| !Arc::ptr_eq(in_flight, &sealed));

        match &result {
            Ok(()) => debug!(
                stream_id = %self.stream_id,
                asn = sealed.record.asn,
                version = sealed.record.version,
                bytes = batch.payload.len(),
                writes = batch.waiters.len(),
                "Flushed coalesced record"
            ),
            Err(err) => warn!(
                stream_id = %self.stream_id,
                asn = sealed.record.asn,
                error = %err,
                "Coalesced flush failed"
            ),
        }

        for waiter in batch.waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    /// Read a record that has not reached the dedicated log yet.
    /// Supports `Exact` and `Containing`.
    pub fn read(&self, asn: Asn, mode: ReadMode) -> Option<LogRecord> {
        let state = self.lock();
        let covers = |first: Asn, end: Asn| match mode {
            ReadMode::Exact => asn == first,
            ReadMode::Containing => first <= asn && asn < end,
            _ => false,
        };

        if let Some(batch) = &state.open {
            if covers(batch.first_asn, batch.next_asn()) {
                return Some(batch.record(self.stream_id, self.fixed_metadata_size));
            }
        }
        state
            .flushing
            .iter()
            .rev()
            .find(|sealed| covers(sealed.record.asn, sealed.end_asn))
            .map(|sealed| sealed.record.clone())
    }

    /// Logical bytes waiting in the open batch.
    pub fn pending_bytes(&self) -> usize {
        self.lock().open.as_ref().map_or(0, |batch| batch.payload.len())
    }

    /// How long the open batch has been accumulating.
    pub fn pending_age(&self) -> Option<Duration> {
        self.lock().open.as_ref().map(|batch| batch.opened_at.elapsed())
    }

    /// True when nothing is buffered or being flushed.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.open.is_none() && state.flushing.is_empty()
    }

    /// Largest logical payload a batch holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
