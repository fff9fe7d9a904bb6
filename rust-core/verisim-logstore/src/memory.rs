// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory log store for VeriSimDB.
//
// Streams keep their records in a `BTreeMap` keyed by ASN behind a tokio
// `RwLock`, so ordered lookups (next, previous, containing) are range scans.
// Containers share a space ledger with their streams. Every stream carries a
// fault plan so tests can inject write failures, read failures and write
// latency. Intended for testing, benchmarks and ephemeral workloads.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::container::{LogContainer, LogFactory, StreamOptions};
use crate::error::{LogStoreError, LogStoreResult};
use crate::stream::LogStream;
use crate::types::{
    Asn, ContainerId, LogRecord, LogStreamType, ReadMode, RecordDisposition, RecordInfo,
    RecordRange, SharedBuffer, SpaceInfo, StreamId, Version, WriteRecord,
};

// ---------------------------------------------------------------------------
// Space ledger
// ---------------------------------------------------------------------------

/// Capacity accounting shared by a container and all of its streams.
/// Reserved bytes count as used.
#[derive(Debug)]
struct SpaceLedger {
    total: u64,
    used: AtomicU64,
}

impl SpaceLedger {
    fn new(total: u64) -> Self {
        Self {
            total,
            used: AtomicU64::new(0),
        }
    }

    fn try_consume(&self, bytes: u64) -> LogStoreResult<()> {
        let total = self.total;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= total)
            })
            .map(|_| ())
            .map_err(|used| LogStoreError::LogFull {
                requested: bytes,
                available: total.saturating_sub(used),
            })
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn info(&self) -> SpaceInfo {
        let used = self.used.load(Ordering::Acquire);
        SpaceInfo {
            total: self.total,
            free: self.total.saturating_sub(used),
        }
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Failures and latency to apply to a stream's operations.
#[derive(Debug, Default)]
struct FaultPlan {
    /// Errors returned by the next writes, one per write.
    write_failures: VecDeque<LogStoreError>,
    /// Error returned by every write while set.
    sticky_write_failure: Option<LogStoreError>,
    /// Latency added to every write.
    write_delay: Duration,
    /// Errors returned by the next reads, one per read.
    read_failures: VecDeque<LogStoreError>,
}

// ---------------------------------------------------------------------------
// InMemoryLogStream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRecord {
    version: Version,
    metadata: SharedBuffer,
    data: SharedBuffer,
    disposition: RecordDisposition,
}

impl StoredRecord {
    fn size(&self) -> u64 {
        (self.metadata.len() + self.data.len()) as u64
    }

    fn info(&self, asn: Asn) -> RecordInfo {
        RecordInfo {
            asn,
            version: self.version,
            disposition: self.disposition,
            metadata_size: self.metadata.len() as u32,
            io_size: self.data.len() as u32,
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    records: BTreeMap<Asn, StoredRecord>,
    truncation: Asn,
    reserved: u64,
    metadata_block: Option<Vec<u8>>,
    truncation_event: Option<Arc<Notify>>,
}

impl StreamState {
    /// Resolve `asn` and `mode` to the key of the matching record.
    fn locate(&self, asn: Asn, mode: ReadMode) -> Option<Asn> {
        let records = &self.records;
        match mode {
            ReadMode::Exact => records.contains_key(&asn).then_some(asn),
            ReadMode::Next => {
                if !records.contains_key(&asn) {
                    return None;
                }
                records
                    .range((Bound::Excluded(asn), Bound::Unbounded))
                    .next()
                    .map(|(k, _)| *k)
            }
            ReadMode::Previous => {
                if !records.contains_key(&asn) {
                    return None;
                }
                records.range(..asn).next_back().map(|(k, _)| *k)
            }
            ReadMode::Containing => records.range(..=asn).next_back().map(|(k, _)| *k),
            ReadMode::NextFromSpecificAsn => records
                .range((Bound::Excluded(asn), Bound::Unbounded))
                .next()
                .map(|(k, _)| *k),
            ReadMode::PreviousFromSpecificAsn => {
                records.range(..asn).next_back().map(|(k, _)| *k)
            }
        }
    }

    fn range(&self) -> RecordRange {
        match (self.records.keys().next(), self.records.keys().next_back()) {
            (Some(low), Some(high)) => RecordRange {
                low: *low,
                high: *high,
                truncation: self.truncation,
            },
            _ => RecordRange {
                low: self.truncation,
                high: self.truncation,
                truncation: self.truncation,
            },
        }
    }

    fn signal_truncation(&self) {
        if let Some(event) = &self.truncation_event {
            event.notify_one();
        }
    }
}

/// An in-memory log stream.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use verisim_logstore::memory::InMemoryLogStream;
/// use verisim_logstore::stream::LogStream;
/// use verisim_logstore::types::{LogStreamType, ReadMode, StreamId, WriteRecord};
///
/// # tokio_test::block_on(async {
/// let stream = InMemoryLogStream::standalone(StreamId::new_v4(), LogStreamType::Plain, 1 << 20);
/// let record = WriteRecord::new(1, 1, Arc::from(vec![0u8; 16]), Arc::from(vec![7u8; 64]));
/// stream.write(record).await.unwrap();
///
/// let read = stream.read(1, ReadMode::Exact).await.unwrap();
/// assert_eq!(read.version, 1);
/// assert_eq!(read.data.len(), 64);
/// # });
/// ```
#[derive(Debug)]
pub struct InMemoryLogStream {
    stream_id: StreamId,
    stream_type: LogStreamType,
    max_record_size: u64,
    ledger: Arc<SpaceLedger>,
    state: RwLock<StreamState>,
    faults: Mutex<FaultPlan>,
    write_count: AtomicU64,
}

impl InMemoryLogStream {
    fn with_ledger(
        stream_id: StreamId,
        stream_type: LogStreamType,
        max_record_size: u64,
        ledger: Arc<SpaceLedger>,
    ) -> Self {
        Self {
            stream_id,
            stream_type,
            max_record_size,
            ledger,
            state: RwLock::new(StreamState::default()),
            faults: Mutex::new(FaultPlan::default()),
            write_count: AtomicU64::new(0),
        }
    }

    /// A stream with its own unbounded space ledger, outside any container.
    pub fn standalone(stream_id: StreamId, stream_type: LogStreamType, max_record_size: u64) -> Self {
        Self::with_ledger(
            stream_id,
            stream_type,
            max_record_size,
            Arc::new(SpaceLedger::new(u64::MAX)),
        )
    }

    /// Fail the next `count` writes with `error`.
    pub async fn fail_next_writes(&self, error: LogStoreError, count: usize) {
        let mut faults = self.faults.lock().await;
        for _ in 0..count {
            faults.write_failures.push_back(error.clone());
        }
    }

    /// Fail every write with `error` until cleared with `None`.
    pub async fn fail_all_writes(&self, error: Option<LogStoreError>) {
        self.faults.lock().await.sticky_write_failure = error;
    }

    /// Add `delay` of latency to every subsequent write.
    pub async fn set_write_delay(&self, delay: Duration) {
        self.faults.lock().await.write_delay = delay;
    }

    /// Fail the next `count` reads with `error`.
    pub async fn fail_next_reads(&self, error: LogStoreError, count: usize) {
        let mut faults = self.faults.lock().await;
        for _ in 0..count {
            faults.read_failures.push_back(error.clone());
        }
    }

    /// Number of records currently held, pending ones included.
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Every record currently held, in ASN order.
    pub async fn snapshot(&self) -> Vec<RecordInfo> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .map(|(asn, record)| record.info(*asn))
            .collect()
    }

    /// Number of write calls that reached this stream, failed ones included.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Bytes held by this stream's records.
    async fn record_bytes(&self) -> u64 {
        let state = self.state.read().await;
        state.records.values().map(StoredRecord::size).sum()
    }

    async fn take_write_fault(&self) -> (Duration, Option<LogStoreError>) {
        let mut faults = self.faults.lock().await;
        let failure = faults
            .write_failures
            .pop_front()
            .or_else(|| faults.sticky_write_failure.clone());
        (faults.write_delay, failure)
    }
}

#[async_trait]
impl LogStream for InMemoryLogStream {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn stream_type(&self) -> LogStreamType {
        self.stream_type
    }

    async fn query_record_range(&self) -> LogStoreResult<RecordRange> {
        Ok(self.state.read().await.range())
    }

    async fn query_record(&self, asn: Asn, mode: ReadMode) -> LogStoreResult<RecordInfo> {
        let state = self.state.read().await;
        Ok(state
            .locate(asn, mode)
            .and_then(|key| state.records.get(&key).map(|r| r.info(key)))
            .unwrap_or_else(|| RecordInfo::none(asn)))
    }

    async fn query_records(&self, low: Asn, high: Asn) -> LogStoreResult<Vec<RecordInfo>> {
        if low > high {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .records
            .range(low..=high)
            .map(|(asn, record)| record.info(*asn))
            .collect())
    }

    async fn read(&self, asn: Asn, mode: ReadMode) -> LogStoreResult<LogRecord> {
        if let Some(error) = self.faults.lock().await.read_failures.pop_front() {
            return Err(error);
        }

        let state = self.state.read().await;
        let key = state
            .locate(asn, mode)
            .ok_or_else(|| LogStoreError::NotFound(format!("asn {asn} ({mode:?})")))?;
        match state.records.get(&key) {
            Some(record) if record.disposition == RecordDisposition::Persisted => Ok(LogRecord {
                asn: key,
                version: record.version,
                metadata: record.metadata.clone(),
                data: record.data.clone(),
            }),
            _ => Err(LogStoreError::NotFound(format!("asn {key} not persisted"))),
        }
    }

    async fn write(&self, record: WriteRecord) -> LogStoreResult<()> {
        self.write_count.fetch_add(1, Ordering::Relaxed);

        let size = record.total_size();
        if size > self.max_record_size {
            return Err(LogStoreError::RecordTooLarge {
                size,
                max: self.max_record_size,
            });
        }

        let (delay, failure) = self.take_write_fault().await;
        if let Some(error) = failure {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Err(error);
        }

        {
            let mut state = self.state.write().await;
            let previous_size = match state.records.get(&record.asn) {
                Some(existing) if existing.version >= record.version => {
                    return Err(LogStoreError::NameCollision {
                        asn: record.asn,
                        version: existing.version,
                    });
                }
                Some(existing) => existing.size(),
                None => 0,
            };

            // Reserved bytes the write consumes are returned to the ledger
            // and the record is charged at its actual size.
            let from_reservation = record.reservation.min(state.reserved);
            if size > from_reservation {
                self.ledger.try_consume(size - from_reservation)?;
            } else {
                self.ledger.release(from_reservation - size);
            }
            state.reserved -= from_reservation;
            self.ledger.release(previous_size);

            // A newer version truncates the tail behind it.
            let superseded: Vec<Asn> = state
                .records
                .range((Bound::Excluded(record.asn), Bound::Unbounded))
                .filter(|(_, stored)| stored.version < record.version)
                .map(|(key, _)| *key)
                .collect();
            for key in superseded {
                if let Some(stale) = state.records.remove(&key) {
                    self.ledger.release(stale.size());
                }
            }

            state.records.insert(
                record.asn,
                StoredRecord {
                    version: record.version,
                    metadata: record.metadata,
                    data: record.data,
                    disposition: RecordDisposition::Pending,
                },
            );
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if let Some(stored) = state.records.get_mut(&record.asn) {
            if stored.version == record.version {
                stored.disposition = RecordDisposition::Persisted;
            }
        }
        Ok(())
    }

    async fn truncate(&self, asn: Asn, preferred: Asn) -> LogStoreResult<()> {
        let mut state = self.state.write().await;
        if asn <= state.truncation {
            return Ok(());
        }
        let retained = state.records.split_off(&asn.saturating_add(1));
        let removed = std::mem::replace(&mut state.records, retained);
        let released: u64 = removed.values().map(StoredRecord::size).sum();
        self.ledger.release(released);
        state.truncation = asn;
        debug!(
            stream_id = %self.stream_id,
            asn,
            preferred,
            removed = removed.len(),
            "Truncated in-memory log stream"
        );
        state.signal_truncation();
        Ok(())
    }

    async fn truncate_below_version(&self, asn: Asn, version: Version) -> LogStoreResult<()> {
        let mut state = self.state.write().await;
        let doomed: Vec<Asn> = state
            .records
            .range(..=asn)
            .filter(|(_, record)| record.version <= version)
            .map(|(key, _)| *key)
            .collect();
        let mut released = 0;
        for key in &doomed {
            if let Some(record) = state.records.remove(key) {
                released += record.size();
            }
        }
        self.ledger.release(released);

        let new_truncation = match state.records.range(..=asn).next() {
            Some((lowest_kept, _)) => lowest_kept.saturating_sub(1),
            None => asn,
        };
        if new_truncation > state.truncation {
            state.truncation = new_truncation;
        }
        state.signal_truncation();
        Ok(())
    }

    async fn delete_record(&self, asn: Asn, version: Version) -> LogStoreResult<()> {
        let mut state = self.state.write().await;
        match state.records.get(&asn) {
            Some(record) if record.version == version => {
                let size = record.size();
                state.records.remove(&asn);
                self.ledger.release(size);
                Ok(())
            }
            _ => Err(LogStoreError::NotFound(format!(
                "asn {asn} version {version}"
            ))),
        }
    }

    async fn update_reservation(&self, delta: i64) -> LogStoreResult<()> {
        let mut state = self.state.write().await;
        if delta >= 0 {
            let grow = delta.unsigned_abs();
            self.ledger.try_consume(grow)?;
            state.reserved += grow;
        } else {
            let shrink = delta.unsigned_abs().min(state.reserved);
            state.reserved -= shrink;
            self.ledger.release(shrink);
        }
        Ok(())
    }

    async fn reservation_space(&self) -> u64 {
        self.state.read().await.reserved
    }

    async fn set_truncation_completion_event(&self, event: Option<Arc<Notify>>) {
        self.state.write().await.truncation_event = event;
    }

    async fn write_metadata(&self, block: Vec<u8>) -> LogStoreResult<()> {
        self.state.write().await.metadata_block = Some(block);
        Ok(())
    }

    async fn read_metadata(&self) -> LogStoreResult<Vec<u8>> {
        self.state
            .read()
            .await
            .metadata_block
            .clone()
            .ok_or_else(|| LogStoreError::NotFound(format!("metadata of {}", self.stream_id)))
    }
}

// ---------------------------------------------------------------------------
// InMemoryLogContainer
// ---------------------------------------------------------------------------

/// An in-memory log container holding any number of streams.
#[derive(Debug)]
pub struct InMemoryLogContainer {
    container_id: ContainerId,
    path: Option<String>,
    max_record_size: u64,
    record_overhead: u64,
    ledger: Arc<SpaceLedger>,
    streams: RwLock<HashMap<StreamId, Arc<InMemoryLogStream>>>,
    closed: AtomicBool,
}

impl InMemoryLogContainer {
    /// Create an empty container with `size` bytes of capacity.
    pub fn new(container_id: ContainerId, path: Option<String>, size: u64, max_record_size: u64) -> Self {
        Self {
            container_id,
            path,
            max_record_size,
            record_overhead: 0,
            ledger: Arc::new(SpaceLedger::new(size)),
            streams: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the per-record system metadata overhead reported to callers.
    pub fn with_record_overhead(mut self, overhead: u64) -> Self {
        self.record_overhead = overhead;
        self
    }

    /// Concrete handle to a stream, for fault injection and inspection.
    pub async fn stream(&self, stream_id: StreamId) -> Option<Arc<InMemoryLogStream>> {
        self.streams.read().await.get(&stream_id).cloned()
    }

    /// Number of streams in the container.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// True after [`LogContainer::close`] until the container is reopened.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }
}

#[async_trait]
impl LogContainer for InMemoryLogContainer {
    fn container_id(&self) -> ContainerId {
        self.container_id
    }

    fn path(&self) -> Option<String> {
        self.path.clone()
    }

    fn max_record_size(&self) -> u64 {
        self.max_record_size
    }

    fn record_overhead(&self) -> u64 {
        self.record_overhead
    }

    async fn open_stream(&self, stream_id: StreamId) -> LogStoreResult<Arc<dyn LogStream>> {
        let streams = self.streams.read().await;
        let stream: Arc<dyn LogStream> = streams
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| LogStoreError::StreamNotFound(stream_id.to_string()))?;
        Ok(stream)
    }

    async fn create_stream(&self, options: StreamOptions) -> LogStoreResult<Arc<dyn LogStream>> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(&options.stream_id) {
            return Err(LogStoreError::AlreadyExists(options.stream_id.to_string()));
        }
        let stream = Arc::new(InMemoryLogStream::with_ledger(
            options.stream_id,
            options.stream_type,
            options.max_record_size.min(self.max_record_size),
            self.ledger.clone(),
        ));
        streams.insert(options.stream_id, stream.clone());
        debug!(
            container_id = %self.container_id,
            stream_id = %options.stream_id,
            "Created in-memory log stream"
        );
        let stream: Arc<dyn LogStream> = stream;
        Ok(stream)
    }

    async fn delete_stream(&self, stream_id: StreamId) -> LogStoreResult<()> {
        let removed = self.streams.write().await.remove(&stream_id);
        let stream = removed.ok_or_else(|| LogStoreError::StreamNotFound(stream_id.to_string()))?;
        let reserved = stream.reservation_space().await;
        self.ledger.release(stream.record_bytes().await + reserved);
        Ok(())
    }

    async fn space_info(&self) -> SpaceInfo {
        self.ledger.info()
    }

    async fn close(&self) -> LogStoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryLogFactory
// ---------------------------------------------------------------------------

/// Creates and locates in-memory containers by id or path.
#[derive(Debug, Default)]
pub struct InMemoryLogFactory {
    containers: RwLock<HashMap<ContainerId, Arc<InMemoryLogContainer>>>,
    paths: RwLock<HashMap<String, ContainerId>>,
    open_failures: Mutex<VecDeque<LogStoreError>>,
}

impl InMemoryLogFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle to a container, for fault injection and inspection.
    pub async fn container(&self, id: ContainerId) -> Option<Arc<InMemoryLogContainer>> {
        self.containers.read().await.get(&id).cloned()
    }

    /// Concrete handle to the container bound to `path`.
    pub async fn container_at(&self, path: &str) -> Option<Arc<InMemoryLogContainer>> {
        let id = self.paths.read().await.get(path).copied()?;
        self.container(id).await
    }

    /// Fail the next `open_container` call with `error`.
    pub async fn fail_next_open(&self, error: LogStoreError) {
        self.open_failures.lock().await.push_back(error);
    }

    /// Register an already-built container, e.g. one with a custom record
    /// overhead.
    pub async fn insert(&self, container: Arc<InMemoryLogContainer>) {
        if let Some(path) = container.path() {
            self.paths.write().await.insert(path, container.container_id());
        }
        self.containers
            .write()
            .await
            .insert(container.container_id(), container);
    }
}

#[async_trait]
impl LogFactory for InMemoryLogFactory {
    async fn open_container(&self, id: ContainerId) -> LogStoreResult<Arc<dyn LogContainer>> {
        if let Some(error) = self.open_failures.lock().await.pop_front() {
            return Err(error);
        }
        let container = self
            .container(id)
            .await
            .ok_or_else(|| LogStoreError::ContainerNotFound(id.to_string()))?;
        container.reopen();
        let container: Arc<dyn LogContainer> = container;
        Ok(container)
    }

    async fn open_container_at(&self, path: &str) -> LogStoreResult<Arc<dyn LogContainer>> {
        if let Some(error) = self.open_failures.lock().await.pop_front() {
            return Err(error);
        }
        let container = self
            .container_at(path)
            .await
            .ok_or_else(|| LogStoreError::ContainerNotFound(path.to_string()))?;
        container.reopen();
        let container: Arc<dyn LogContainer> = container;
        Ok(container)
    }

    async fn create_container(
        &self,
        id: ContainerId,
        path: Option<&str>,
        size: u64,
        max_record_size: u64,
    ) -> LogStoreResult<Arc<dyn LogContainer>> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(&id) {
            return Err(LogStoreError::AlreadyExists(id.to_string()));
        }
        if let Some(path) = path {
            let mut paths = self.paths.write().await;
            if paths.contains_key(path) {
                return Err(LogStoreError::AlreadyExists(path.to_string()));
            }
            paths.insert(path.to_string(), id);
        }
        let container = Arc::new(InMemoryLogContainer::new(
            id,
            path.map(str::to_string),
            size,
            max_record_size,
        ));
        containers.insert(id, container.clone());
        debug!(container_id = %id, size, "Created in-memory log container");
        let container: Arc<dyn LogContainer> = container;
        Ok(container)
    }

    async fn delete_container(&self, id: ContainerId) -> LogStoreResult<()> {
        let removed = self.containers.write().await.remove(&id);
        let container = removed.ok_or_else(|| LogStoreError::ContainerNotFound(id.to_string()))?;
        if let Some(path) = container.path() {
            self.paths.write().await.remove(&path);
        }
        Ok(())
    }
}
