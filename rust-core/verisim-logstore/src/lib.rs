// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// VeriSimDB Log Store Abstraction
//
// This crate defines the physical log interface the overlay engine is built
// on: containers holding append-only, ASN-indexed log streams whose records
// carry versions. The traits are the contract any log implementation must
// satisfy; the in-memory implementation backs tests and benchmarks.
//
// # Modules
//
// - [`types`] -- ASNs, versions, ids, read modes, record descriptors.
// - [`stream`] -- The `LogStream` trait.
// - [`container`] -- The `LogContainer` and `LogFactory` traits.
// - [`error`] -- The `LogStoreError` enum covering all log failure modes.
// - [`memory`] -- `BTreeMap`-based streams, containers and a factory, with
//   fault injection for tests.
// - [`metrics`] -- A transparent wrapper that collects operation statistics.
//
// # Example
//
// ```rust
// use std::sync::Arc;
// use verisim_logstore::{
//     ContainerId, InMemoryLogFactory, LogContainer, LogFactory, LogStream, LogStreamType,
//     ReadMode, StreamId, StreamOptions, WriteRecord,
// };
//
// # tokio_test::block_on(async {
// let factory = InMemoryLogFactory::new();
// let container = factory
//     .create_container(ContainerId::new_v4(), None, 1 << 20, 64 * 1024)
//     .await
//     .unwrap();
// let stream = container
//     .create_stream(StreamOptions {
//         stream_id: StreamId::new_v4(),
//         stream_type: LogStreamType::Plain,
//         max_record_size: 64 * 1024,
//     })
//     .await
//     .unwrap();
//
// let record = WriteRecord::new(1, 1, Arc::from(vec![0u8; 8]), Arc::from(vec![0u8; 56]));
// stream.write(record).await.unwrap();
// assert_eq!(stream.read(1, ReadMode::Exact).await.unwrap().version, 1);
// # });
// ```

pub mod container;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod stream;
pub mod types;

// Re-export the most commonly used types at the crate root for convenience.
pub use container::{LogContainer, LogFactory, StreamOptions};
pub use error::{LogStoreError, LogStoreResult};
pub use memory::{InMemoryLogContainer, InMemoryLogFactory, InMemoryLogStream};
pub use metrics::{LogStreamStats, MetricsLogStream};
pub use stream::LogStream;
pub use types::{
    empty_buffer, Asn, ContainerId, LogRecord, LogStreamType, ReadMode, RecordDisposition,
    RecordInfo, RecordRange, SharedBuffer, SpaceInfo, StreamId, Version, WriteRecord, ASN_MAX,
    ASN_MIN, ASN_NULL, VERSION_MAX,
};
