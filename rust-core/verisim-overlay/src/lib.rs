// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// VeriSimDB Overlay Log
//
// A dual-log destaging engine. Each overlay stream writes every record to a
// shared log, multiplexed across streams for low latency, and to a dedicated
// log owned by the stream. Callers see a single stream: a write completes as
// soon as one log holds it durably, reads resolve the authoritative copy,
// and the shared copy is truncated once the dedicated copy is durable. On
// open, records left only in the shared log are copied forward.
//
// Logical-log streams additionally carry a `LogicalLogHeader` in every
// record, enforce strictly sequential versions, track a logical tail, and
// batch writes through a coalesce buffer before they reach the dedicated log.
//
// # Modules
//
// - [`manager`] -- `OverlayLog`, which owns the shared container and opens
//   streams.
// - [`stream`] -- `OverlayStream` state, queries and shared-log truncation.
// - [`open`] / [`close`] -- Stream lifecycle state machines.
// - [`write`] -- Destaging writes fanned out to both logs.
// - [`read`] / [`multi_read`] -- Record resolution and logical-log reads.
// - [`truncate`] -- Caller truncation, deferred when not yet resolvable.
// - [`coalesce`] -- Batching of logical-log writes.
// - [`throttle`] / [`allocator`] -- Write and memory back-pressure.
// - [`header`] -- The logical-log record header codec.
// - [`ioctl`] -- Control and query requests.
// - [`config`] / [`error`] -- Configuration and the `OverlayError` enum.
//
// # Example
//
// ```rust
// use std::sync::Arc;
// use verisim_logstore::{
//     ContainerId, InMemoryLogFactory, LogFactory, LogStreamType, ReadMode, StreamId,
// };
// use verisim_overlay::{OverlayConfig, OverlayLog, OverlayStreamOptions, WriteRequest};
//
// # tokio_test::block_on(async {
// let factory = Arc::new(InMemoryLogFactory::new());
// let shared = factory
//     .create_container(ContainerId::new_v4(), None, 64 << 20, 1 << 20)
//     .await
//     .unwrap();
// let overlay = OverlayLog::new(shared, factory, OverlayConfig::default()).unwrap();
//
// let stream = overlay
//     .create_stream(OverlayStreamOptions {
//         stream_id: StreamId::new_v4(),
//         stream_type: LogStreamType::Plain,
//         dedicated_path: None,
//         dedicated_size: 64 << 20,
//         max_record_size: 1 << 20,
//     })
//     .await
//     .unwrap();
//
// let request = WriteRequest::new(1, 1, Arc::from(vec![1u8; 16]), Arc::from(vec![2u8; 64]));
// stream.write(request).await.unwrap();
// assert_eq!(stream.read(1, ReadMode::Exact).await.unwrap().record.version, 1);
// # });
// ```

pub mod allocator;
pub mod backup;
pub mod close;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod header;
pub mod ioctl;
pub mod manager;
pub mod metadata;
pub mod multi_read;
pub mod open;
pub mod read;
pub mod refs;
pub mod stats;
pub mod stream;
pub mod tables;
pub mod threshold;
pub mod throttle;
pub mod truncate;
pub mod write;

pub use config::{OverlayConfig, WRITE_THROTTLE_THRESHOLD_MINIMUM, WRITE_THROTTLE_THRESHOLD_NO_LIMIT};
pub use error::{OverlayError, OverlayResult};
pub use header::{encode_record, LogicalLogHeader, HEADER_SIZE};
pub use ioctl::{IoctlRequest, IoctlResponse};
pub use manager::OverlayLog;
pub use multi_read::MultiRecordRead;
pub use read::{ReadRecord, RecordSource};
pub use stats::TelemetrySnapshot;
pub use stream::{LogUsage, OverlayStream, OverlayStreamOptions, StreamState};
pub use truncate::TruncateOutcome;
pub use write::{WriteOutcome, WriteRequest};
