// SPDX-License-Identifier: PMPL-1.0-or-later
//! Integration tests for overlay streams
//!
//! Exercises writes, reads, truncation and control requests end to end
//! against in-memory shared and dedicated logs, including injected latency
//! and write failures on either log.

mod common;

use std::time::{Duration, Instant};

use common::*;
use verisim_logstore::{
    LogStoreError, LogStream as _, LogStreamType, ReadMode, StreamId, WriteRecord,
};
use verisim_overlay::{
    IoctlRequest, IoctlResponse, LogicalLogHeader, MultiRecordRead, OverlayConfig, OverlayError,
    RecordSource, TruncateOutcome, WRITE_THROTTLE_THRESHOLD_NO_LIMIT,
};

// ---------------------------------------------------------------------------
// Plain streams
// ---------------------------------------------------------------------------

/// Writes land in both logs, read back from the dedicated log, and the shared
/// copies are truncated away once the dedicated copies are durable.
#[tokio::test]
async fn test_plain_write_then_read() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;

    for asn in 1..=5 {
        let outcome = stream.write(plain_write(asn, asn)).await.unwrap();
        assert!(outcome.sent_to_shared);
        assert_eq!(outcome.log_size, DEDICATED_SIZE);
    }

    let read = stream.read(3, ReadMode::Exact).await.unwrap();
    assert_eq!(read.record.asn, 3);
    assert_eq!(read.record.version, 3);
    assert_eq!(read.record.data.len(), 256);

    let shared = h.shared_log(stream.stream_id()).await;
    assert!(eventually(|| async { shared.record_count().await == 0 }).await);
    assert_eq!(h.dedicated_log(stream.stream_id()).await.record_count().await, 5);
    assert_eq!(stream.outstanding_dedicated_writes(), 0);
}

/// A write that exhausts the shared log is retried until it fits; log-full
/// never degrades the stream.
#[tokio::test]
async fn test_shared_log_full_is_retried() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    let shared = h.shared_log(stream.stream_id()).await;
    shared
        .fail_next_writes(
            LogStoreError::LogFull {
                requested: 4096,
                available: 0,
            },
            3,
        )
        .await;
    stream
        .ioctl(IoctlRequest::DelayDedicatedWrites(200))
        .await
        .unwrap();

    let outcome = stream.write(plain_write(1, 1)).await.unwrap();
    assert!(outcome.sent_to_shared);
    assert!(shared.write_count() >= 4);
    assert!(!stream.is_write_only_to_dedicated());
    assert!(stream.failure_status().is_none());
}

/// A shared log that stays full never holds the caller back: the dedicated
/// write completes it and the shared retries stop.
#[tokio::test]
async fn test_dedicated_completes_while_shared_log_stays_full() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    let shared = h.shared_log(stream.stream_id()).await;
    shared
        .fail_all_writes(Some(LogStoreError::LogFull {
            requested: 4096,
            available: 0,
        }))
        .await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), stream.write(plain_write(1, 1)))
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.sent_to_shared);

    assert!(
        eventually(|| async {
            stream.outstanding_dedicated_writes() == 0 && stream.outstanding_shared_writes() == 0
        })
        .await
    );
    let attempts = shared.write_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shared.write_count(), attempts);

    assert!(!stream.is_write_only_to_dedicated());
    assert!(stream.failure_status().is_none());
    assert_eq!(shared.record_count().await, 0);
    let read = stream.read(1, ReadMode::Exact).await.unwrap();
    assert_eq!(read.source, RecordSource::Dedicated);
}

/// Any other shared failure leaves the write to the dedicated log and sends
/// later writes to the dedicated log only.
#[tokio::test]
async fn test_shared_failure_degrades_to_dedicated_only() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    h.shared_log(stream.stream_id())
        .await
        .fail_next_writes(LogStoreError::BackendUnavailable("shared disk".into()), 1)
        .await;

    stream.write(plain_write(1, 1)).await.unwrap();
    assert!(eventually(|| async { stream.is_write_only_to_dedicated() }).await);

    let outcome = stream.write(plain_write(2, 2)).await.unwrap();
    assert!(!outcome.sent_to_shared);
    assert!(stream.failure_status().is_none());
    assert_eq!(stream.read(2, ReadMode::Exact).await.unwrap().record.version, 2);
}

/// A dedicated failure fails the stream for every later write.
#[tokio::test]
async fn test_dedicated_failure_is_sticky() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    h.dedicated_log(stream.stream_id())
        .await
        .fail_next_writes(LogStoreError::BackendUnavailable("dedicated disk".into()), 1)
        .await;

    // Whether this write reports the failure depends on which log finishes
    // first; the stream must fail either way.
    let _ = stream.write(plain_write(1, 1)).await;
    assert!(eventually(|| async { stream.failure_status().is_some() }).await);

    let err = stream.write(plain_write(2, 2)).await.unwrap_err();
    assert!(matches!(err, OverlayError::StreamFailed(_)));
    assert_eq!(
        stream.truncate(1).await.unwrap(),
        TruncateOutcome::Skipped
    );
}

/// A truncation may not reach a write still outstanding in the dedicated log.
#[tokio::test]
async fn test_truncation_below_outstanding_write() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    stream
        .ioctl(IoctlRequest::DelayDedicatedWrites(300))
        .await
        .unwrap();

    stream.write(plain_write(10, 1)).await.unwrap();
    assert_eq!(stream.lowest_outstanding_dedicated_asn(), 10);

    let err = stream.truncate(15).await.unwrap_err();
    assert!(matches!(err, OverlayError::InvalidParameter(_)));
    let err = stream.truncate(10).await.unwrap_err();
    assert!(matches!(err, OverlayError::InvalidParameter(_)));
    assert_eq!(stream.truncate(5).await.unwrap(), TruncateOutcome::Applied(5));

    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);
    assert_eq!(stream.truncate(15).await.unwrap(), TruncateOutcome::Applied(15));
}

/// A Next read anchored in the dedicated log finds a later record that only
/// the shared log holds.
#[tokio::test]
async fn test_next_read_crosses_logs() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    stream
        .ioctl(IoctlRequest::WriteOnlyToDedicatedLog)
        .await
        .unwrap();

    let outcome = stream.write(plain_write(40, 1)).await.unwrap();
    assert!(!outcome.sent_to_shared);

    let injected = plain_write(42, 1);
    h.shared_log(stream.stream_id())
        .await
        .write(WriteRecord::new(42, 1, injected.metadata, injected.data))
        .await
        .unwrap();

    let next = stream.read(40, ReadMode::Next).await.unwrap();
    assert_eq!(next.record.asn, 42);
    assert_eq!(next.source, RecordSource::Shared);

    let previous = stream.read(42, ReadMode::Previous).await.unwrap();
    assert_eq!(previous.record.asn, 40);
    assert_eq!(previous.source, RecordSource::Dedicated);

    let err = stream.read(41, ReadMode::Next).await.unwrap_err();
    assert!(err.is_not_found());
}

/// When both logs hold an ASN the higher version is returned.
#[tokio::test]
async fn test_read_prefers_higher_version() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    stream.write(plain_write(5, 1)).await.unwrap();
    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);

    let newer = plain_write(5, 2);
    h.shared_log(stream.stream_id())
        .await
        .write(WriteRecord::new(5, 2, newer.metadata, newer.data))
        .await
        .unwrap();

    let read = stream.read(5, ReadMode::Exact).await.unwrap();
    assert_eq!(read.record.version, 2);
    assert_eq!(read.source, RecordSource::Shared);

    let info = stream.query_record(5, ReadMode::Exact).await.unwrap();
    assert_eq!(info.version, 2);
}

/// A Containing read returns the higher version when the logs disagree,
/// whether they hold the same ASN or different ones.
#[tokio::test]
async fn test_containing_read_prefers_higher_version() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    stream.write(plain_write(5, 1)).await.unwrap();
    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);

    let newer = plain_write(5, 2);
    h.shared_log(stream.stream_id())
        .await
        .write(WriteRecord::new(5, 2, newer.metadata, newer.data))
        .await
        .unwrap();

    let read = stream.read(7, ReadMode::Containing).await.unwrap();
    assert_eq!(read.record.asn, 5);
    assert_eq!(read.record.version, 2);
    assert_eq!(read.source, RecordSource::Shared);

    let older = plain_write(6, 1);
    h.dedicated_log(stream.stream_id())
        .await
        .write(WriteRecord::new(6, 1, older.metadata, older.data))
        .await
        .unwrap();

    let read = stream.read(7, ReadMode::Containing).await.unwrap();
    assert_eq!(read.record.asn, 5);
    assert_eq!(read.record.version, 2);
    assert_eq!(read.source, RecordSource::Shared);
}

// ---------------------------------------------------------------------------
// Logical-log streams
// ---------------------------------------------------------------------------

/// An empty logical stream takes only version 1 at the first offset.
#[tokio::test]
async fn test_empty_logical_stream_enforces_sequence() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    let err = stream
        .write(logical_write(id, 1, 7, &payload(10, 7), true))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OverlayError::OutOfSequence {
            expected: 1,
            ..
        }
    ));

    let err = stream
        .write(logical_write(id, 5000, 1, &payload(10, 1), true))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::OutOfSequence { .. }));

    assert_eq!(stream.logical_tail(), 1);
    assert_eq!(stream.last_version(), 0);
    assert_eq!(h.dedicated_log(id).await.record_count().await, 0);

    stream
        .write(logical_write(id, 1, 1, &payload(10, 1), true))
        .await
        .unwrap();
    assert_eq!(stream.logical_tail(), 11);
    assert_eq!(stream.last_version(), 1);
}

/// The first write of a stream truncates the tail, so it completes only
/// after both logs have finished.
#[tokio::test]
async fn test_truncate_tail_write_waits_for_both_logs() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();
    stream
        .ioctl(IoctlRequest::DelaySharedWrites(200))
        .await
        .unwrap();

    let started = Instant::now();
    let outcome = stream
        .write(logical_write(id, 1, 1, &payload(49, 1), true))
        .await
        .unwrap();
    assert!(outcome.sent_to_shared);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(stream.logical_tail(), 50);
    assert_eq!(stream.last_version(), 1);
}

/// Writes below the tail truncate it, reads never see the superseded bytes,
/// and the recovered tail matches after reopening.
#[tokio::test]
async fn test_truncate_tail_trims_reads() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    stream
        .write(logical_write(id, 1, 1, &payload(99, 1), true))
        .await
        .unwrap();
    stream
        .write(logical_write(id, 100, 2, &payload(50, 2), true))
        .await
        .unwrap();
    assert_eq!(stream.logical_tail(), 150);

    stream
        .write(logical_write(id, 120, 3, &payload(10, 3), true))
        .await
        .unwrap();
    assert_eq!(stream.logical_tail(), 130);
    assert_eq!(stream.last_version(), 3);

    let read = stream.read(110, ReadMode::Containing).await.unwrap();
    assert_eq!(read.record.asn, 100);
    let header = LogicalLogHeader::parse(&read.record.metadata).unwrap();
    assert_eq!(header.data_size, 20);
    header
        .verify_data(&read.record.metadata, &read.record.data)
        .unwrap();
    assert_eq!(
        header.payload(&read.record.metadata, &read.record.data).unwrap(),
        payload(50, 2)[..20].to_vec()
    );

    let err = stream.read(135, ReadMode::Containing).await.unwrap_err();
    assert_eq!(err, OverlayError::NotFound(135));

    let err = stream
        .write(logical_write(id, 125, 4, &payload(5, 4), false))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::InvalidParameter(_)));

    let err = stream
        .write(logical_write(id, 130, 7, &payload(5, 4), true))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OverlayError::OutOfSequence {
            expected: 4,
            ..
        }
    ));

    let err = stream
        .write(logical_write(id, 200, 4, &payload(5, 4), true))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::OutOfSequence { .. }));
    assert_eq!(stream.logical_tail(), 130);

    h.overlay.close_stream(id).await.unwrap();
    let reopened = h.overlay.open_stream(id, None).await.unwrap();
    assert_eq!(reopened.logical_tail(), 130);
    assert_eq!(reopened.last_version(), 3);
}

/// Headers that disagree with the request are rejected.
#[tokio::test]
async fn test_logical_write_header_validation() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();
    stream
        .write(logical_write(id, 1, 1, &payload(9, 1), true))
        .await
        .unwrap();

    let foreign = logical_write(StreamId::new_v4(), 10, 2, &payload(4, 2), true);
    let err = stream.write(foreign).await.unwrap_err();
    assert!(matches!(err, OverlayError::InvalidHeader(_)));

    let mut shifted = logical_write(id, 10, 2, &payload(4, 2), true);
    shifted.asn = 9;
    let err = stream.write(shifted).await.unwrap_err();
    assert!(matches!(err, OverlayError::InvalidHeader(_)));

    let err = stream
        .read(1, ReadMode::Next)
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotSupported(_)));
}

/// Coalesced writes are readable from the buffer before they are flushed and
/// from the dedicated log afterwards.
#[tokio::test]
async fn test_coalesced_writes_are_readable() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    let mut asn = 1;
    for version in 1..=4u64 {
        stream
            .write(logical_write(id, asn, version, &payload(25, version as u8), true))
            .await
            .unwrap();
        asn += 25;
    }
    assert_eq!(stream.logical_tail(), 101);

    let read = stream.read(60, ReadMode::Containing).await.unwrap();
    assert!(read.record.asn <= 60);
    assert!(matches!(
        read.source,
        RecordSource::CoalesceBuffer | RecordSource::Dedicated
    ));

    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);
    let read = stream.read(60, ReadMode::Containing).await.unwrap();
    assert_eq!(read.source, RecordSource::Dedicated);
    let header = LogicalLogHeader::parse(&read.record.metadata).unwrap();
    let bytes = header
        .payload(&read.record.metadata, &read.record.data)
        .unwrap();
    let offset = (60 - read.record.asn) as usize;
    assert_eq!(bytes[offset], payload(25, 3)[60 - 51]);
}

/// Small records are stitched into one read starting at the requested
/// offset.
#[tokio::test]
async fn test_multi_record_read() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    let chunks: Vec<Vec<u8>> = (0..3).map(|i| payload(10, 10 * i as u8)).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        stream
            .write(logical_write(id, 1 + 10 * i as u64, i as u64 + 1, chunk, true))
            .await
            .unwrap();
    }

    let read = stream
        .read_multi_record(
            5,
            MultiRecordRead {
                minimum_first_read: 64,
                io_size: 4096,
            },
        )
        .await
        .unwrap();
    assert_eq!(read.record.asn, 5);
    let header = LogicalLogHeader::parse(&read.record.metadata).unwrap();
    assert_eq!(header.data_size, 26);
    assert_eq!(header.record_end_offset(), Some(31));

    let expected: Vec<u8> = chunks.concat()[4..].to_vec();
    assert_eq!(
        header.payload(&read.record.metadata, &read.record.data).unwrap(),
        expected
    );

    let plain = h.create(LogStreamType::Plain, None).await;
    let err = plain
        .read_multi_record(
            1,
            MultiRecordRead {
                minimum_first_read: 1,
                io_size: 1,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotSupported(_)));
}

/// A logical truncation keeps the record containing the requested offset.
#[tokio::test]
async fn test_logical_truncation_keeps_containing_record() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    stream
        .write(logical_write(id, 1, 1, &payload(99, 1), true))
        .await
        .unwrap();
    stream
        .write(logical_write(id, 100, 2, &payload(50, 2), true))
        .await
        .unwrap();
    stream
        .write(logical_write(id, 150, 3, &payload(10, 3), true))
        .await
        .unwrap();
    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);

    assert_eq!(
        stream.truncate(160).await.unwrap(),
        TruncateOutcome::Applied(100)
    );
    let read = stream.read(155, ReadMode::Containing).await.unwrap();
    assert_eq!(read.record.asn, 150);
    assert!(stream.read(50, ReadMode::Containing).await.is_err());

    let err = stream.truncate(500).await.unwrap_err();
    assert!(matches!(err, OverlayError::InvalidParameter(_)));
}

/// A truncation whose containing record is missing from the dedicated log
/// is parked on the next outstanding write and retried when it completes.
#[tokio::test]
async fn test_logical_truncation_is_deferred() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    stream
        .write(logical_write(id, 1, 1, &payload(49, 1), true))
        .await
        .unwrap();
    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);

    // The dedicated log no longer holds the record covering offset 20.
    h.dedicated_log(id).await.truncate(1, 1).await.unwrap();

    stream
        .ioctl(IoctlRequest::DelayDedicatedWrites(200))
        .await
        .unwrap();
    stream
        .write(logical_write(id, 50, 2, &payload(50, 2), true))
        .await
        .unwrap();
    assert_eq!(stream.logical_tail(), 100);
    assert_eq!(stream.outstanding_dedicated_writes(), 1);

    assert_eq!(
        stream.truncate(20).await.unwrap(),
        TruncateOutcome::Deferred { onto: 50 }
    );

    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);
    let read = stream.read(60, ReadMode::Containing).await.unwrap();
    assert_eq!(read.record.asn, 50);
    assert_eq!(read.source, RecordSource::Dedicated);
}

/// The truncation point walks back past every predecessor written with a
/// higher version than the containing record.
#[tokio::test]
async fn test_logical_truncation_skips_newer_predecessors() {
    let h = Harness::new(uncoalesced_config());
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    stream
        .write(logical_write(id, 1, 1, &payload(29, 1), true))
        .await
        .unwrap();
    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);

    let dedicated = h.dedicated_log(id).await;
    for (asn, version) in [(5, 4), (10, 5), (20, 3)] {
        let (metadata, data) = logical_record(id, asn, version, &payload(5, version as u8));
        dedicated
            .write(WriteRecord::new(asn, version, metadata, data))
            .await
            .unwrap();
    }

    assert_eq!(
        stream.truncate(25).await.unwrap(),
        TruncateOutcome::Applied(1)
    );
    let remaining: Vec<u64> = dedicated.snapshot().await.iter().map(|info| info.asn).collect();
    assert_eq!(remaining, vec![5, 10, 20]);
}

/// A truncate-tail write whose coalesce flush fails hands back the
/// dedicated reservation it took.
#[tokio::test]
async fn test_failed_tail_flush_releases_reservation() {
    let h = Harness::new(OverlayConfig {
        coalesce_flush_period_ms: 60_000,
        ..test_config()
    });
    let stream = h.create(LogStreamType::Logical, None).await;
    let id = stream.stream_id();

    stream
        .write(logical_write(id, 1, 1, &payload(49, 1), true).with_force_flush())
        .await
        .unwrap();
    stream
        .write(logical_write(id, 50, 2, &payload(50, 2), true))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            matches!(
                stream.read(60, ReadMode::Containing).await,
                Ok(read) if read.source == RecordSource::CoalesceBuffer
            )
        })
        .await
    );

    let dedicated = h.dedicated_log(id).await;
    let reserved = dedicated.reservation_space().await;
    dedicated
        .fail_next_writes(LogStoreError::BackendUnavailable("dedicated disk".into()), 1)
        .await;

    let err = stream
        .write(logical_write(id, 20, 3, &payload(5, 3), true))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OverlayError::Log(LogStoreError::BackendUnavailable("dedicated disk".into()))
    );
    assert_eq!(dedicated.reservation_space().await, reserved);
}

// ---------------------------------------------------------------------------
// Control requests and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ioctl_requests() {
    let h = Harness::new(test_config());
    let logical = h.create(LogStreamType::Logical, None).await;
    let plain = h.create(LogStreamType::Plain, None).await;

    let err = plain
        .ioctl(IoctlRequest::QueryLogicalLogTailAsnAndHighestOperation)
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotSupported(_)));

    match logical
        .ioctl(IoctlRequest::QueryLogicalLogTailAsnAndHighestOperation)
        .await
        .unwrap()
    {
        IoctlResponse::LogicalLogTail {
            tail_asn,
            highest_operation_id,
            max_block_size,
            ..
        } => {
            assert_eq!(tail_asn, 1);
            assert_eq!(highest_operation_id, 0);
            assert_eq!(max_block_size, MAX_RECORD_SIZE);
        }
        other => panic!("unexpected response {other:?}"),
    }

    let err = plain
        .ioctl(IoctlRequest::SetWriteThrottleThreshold(1))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::InvalidParameter(_)));
    let previous = plain
        .ioctl(IoctlRequest::SetWriteThrottleThreshold(
            WRITE_THROTTLE_THRESHOLD_NO_LIMIT,
        ))
        .await
        .unwrap();
    assert_eq!(
        previous,
        IoctlResponse::PreviousThrottleThreshold(test_config().dedicated_write_throttle_threshold)
    );

    assert_eq!(
        plain.ioctl(IoctlRequest::DelaySharedWrites(7)).await.unwrap(),
        IoctlResponse::PreviousDelayMillis(0)
    );
    assert_eq!(
        plain.ioctl(IoctlRequest::DelaySharedWrites(0)).await.unwrap(),
        IoctlResponse::PreviousDelayMillis(7)
    );

    match plain
        .ioctl(IoctlRequest::QueryLogSizeAndSpaceRemaining)
        .await
        .unwrap()
    {
        IoctlResponse::LogSizeAndSpaceRemaining { log_size, .. } => {
            assert_eq!(log_size, DEDICATED_SIZE)
        }
        other => panic!("unexpected response {other:?}"),
    }

    assert_eq!(
        plain.ioctl(IoctlRequest::QueryCurrentWriteInformation).await.unwrap(),
        IoctlResponse::WriteInformation {
            lowest_outstanding_dedicated_asn: u64::MAX
        }
    );
}

/// Telemetry counts application, shared and dedicated bytes.
#[tokio::test]
async fn test_telemetry_counts_bytes() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    for asn in 1..=3 {
        stream.write(plain_write(asn, asn)).await.unwrap();
    }
    assert!(eventually(|| async { stream.outstanding_dedicated_writes() == 0 }).await);

    let snapshot = match stream
        .ioctl(IoctlRequest::QueryTelemetryStatistics)
        .await
        .unwrap()
    {
        IoctlResponse::Telemetry(snapshot) => snapshot,
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(snapshot.application_bytes_written, 3 * (32 + 256));
    assert_eq!(snapshot.dedicated_bytes_written, 3 * (32 + 256));
    assert_eq!(snapshot.shared_bytes_written, 3 * (32 + 256));
    assert_eq!(snapshot.dedicated_bytes_outstanding, 0);
}

/// A threshold at or below the current usage fires at once.
#[tokio::test]
async fn test_usage_threshold_notification() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    stream.write(plain_write(1, 1)).await.unwrap();

    let fired = stream.register_threshold(0).await.unwrap();
    let percent = tokio::time::timeout(Duration::from_secs(1), fired)
        .await
        .unwrap()
        .unwrap();
    assert!(percent <= 100);

    assert!(stream.register_threshold(101).await.is_err());
}

#[tokio::test]
async fn test_metadata_block_round_trip() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;

    stream.write_metadata(b"checkpoint".to_vec()).await.unwrap();
    assert_eq!(stream.read_metadata().await.unwrap(), b"checkpoint".to_vec());

    stream.update_reservation(8192).await.unwrap();
    assert_eq!(stream.reservation_space().await.unwrap(), 8192);
    stream.update_reservation(-4096).await.unwrap();
    assert_eq!(stream.reservation_space().await.unwrap(), 4096);
}

/// A closed stream refuses requests; reopening restores access.
#[tokio::test]
async fn test_closed_stream_refuses_requests() {
    let h = Harness::new(test_config());
    let stream = h.create(LogStreamType::Plain, None).await;
    let id = stream.stream_id();
    stream.write(plain_write(1, 1)).await.unwrap();

    h.overlay.close_stream(id).await.unwrap();
    let err = stream.write(plain_write(2, 2)).await.unwrap_err();
    assert_eq!(err, OverlayError::ObjectNoLongerExists);
    assert_eq!(
        h.overlay.close_stream(id).await.unwrap_err(),
        OverlayError::ObjectNoLongerExists
    );

    let reopened = h.overlay.open_stream(id, None).await.unwrap();
    assert_eq!(reopened.read(1, ReadMode::Exact).await.unwrap().record.version, 1);
    assert_eq!(h.overlay.open_stream_count().await, 1);

    h.overlay.delete_stream(id).await.unwrap();
    assert_eq!(h.overlay.open_stream_count().await, 0);
    assert!(h.shared.stream(id).await.is_none());
}
