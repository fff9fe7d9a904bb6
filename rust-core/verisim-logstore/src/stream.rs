// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core log stream trait for VeriSimDB.
//
// A `LogStream` is an append-only, ASN-indexed record store. Records carry a
// version, may be queried without reading their payload, and can be removed
// individually or by truncation. Implementations must be thread-safe and
// fully asynchronous.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::LogStoreResult;
use crate::types::{
    Asn, LogRecord, LogStreamType, ReadMode, RecordInfo, RecordRange, StreamId, Version,
    WriteRecord,
};

/// A single ASN-indexed log stream inside a container.
#[async_trait]
pub trait LogStream: Send + Sync {
    /// Identity of this stream.
    fn stream_id(&self) -> StreamId;

    /// What kind of data the stream holds.
    fn stream_type(&self) -> LogStreamType;

    /// Lowest and highest ASN present plus the truncation point.
    async fn query_record_range(&self) -> LogStoreResult<RecordRange>;

    /// Look up a record relative to `asn` without reading its payload.
    ///
    /// Returns a record with `RecordDisposition::None` when nothing matches.
    async fn query_record(&self, asn: Asn, mode: ReadMode) -> LogStoreResult<RecordInfo>;

    /// All records with `low <= asn <= high`, in ascending ASN order.
    async fn query_records(&self, low: Asn, high: Asn) -> LogStoreResult<Vec<RecordInfo>>;

    /// Read a persisted record relative to `asn`.
    ///
    /// Fails with `LogStoreError::NotFound` when no persisted record matches.
    async fn read(&self, asn: Asn, mode: ReadMode) -> LogStoreResult<LogRecord>;

    /// Write a record, consuming up to `record.reservation` bytes of space
    /// reserved earlier with [`LogStream::update_reservation`].
    ///
    /// Writing an ASN that already holds the same or a newer version fails
    /// with `LogStoreError::NameCollision`; an older version is replaced.
    async fn write(&self, record: WriteRecord) -> LogStoreResult<()>;

    /// Discard every record at or below `asn`. `preferred` is a hint for how
    /// far the implementation may actually go and is never below `asn`.
    async fn truncate(&self, asn: Asn, preferred: Asn) -> LogStoreResult<()>;

    /// Discard records at or below `asn` whose version does not exceed
    /// `version`.
    async fn truncate_below_version(&self, asn: Asn, version: Version) -> LogStoreResult<()>;

    /// Remove the record at `asn` if it carries `version`.
    async fn delete_record(&self, asn: Asn, version: Version) -> LogStoreResult<()>;

    /// Grow (positive) or shrink (negative) the stream's space reservation.
    async fn update_reservation(&self, delta: i64) -> LogStoreResult<()>;

    /// Bytes currently reserved by this stream.
    async fn reservation_space(&self) -> u64;

    /// Register (or clear) a signal raised each time a truncation completes.
    async fn set_truncation_completion_event(&self, event: Option<Arc<Notify>>);

    /// Replace the stream's metadata block.
    async fn write_metadata(&self, block: Vec<u8>) -> LogStoreResult<()>;

    /// Read the stream's metadata block.
    async fn read_metadata(&self) -> LogStoreResult<Vec<u8>>;
}
