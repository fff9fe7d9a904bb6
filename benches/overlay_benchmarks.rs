// SPDX-License-Identifier: PMPL-1.0-or-later
//! Performance benchmarks for the VeriSimDB overlay log

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

use verisim_logstore::{
    ContainerId, InMemoryLogContainer, InMemoryLogFactory, LogStreamType, ReadMode, StreamId,
};
use verisim_overlay::{
    encode_record, LogicalLogHeader, OverlayConfig, OverlayLog, OverlayStream,
    OverlayStreamOptions, WriteRequest,
};

const CONTAINER_SIZE: u64 = 1 << 34;
const MAX_RECORD_SIZE: u64 = 1 << 20;

fn overlay(config: OverlayConfig) -> OverlayLog {
    let factory = Arc::new(InMemoryLogFactory::new());
    let shared = Arc::new(InMemoryLogContainer::new(
        ContainerId::new_v4(),
        None,
        CONTAINER_SIZE,
        MAX_RECORD_SIZE,
    ));
    OverlayLog::new(shared, factory, config).unwrap()
}

async fn open_stream(overlay: &OverlayLog, stream_type: LogStreamType) -> Arc<OverlayStream> {
    overlay
        .create_stream(OverlayStreamOptions {
            stream_id: StreamId::new_v4(),
            stream_type,
            dedicated_path: None,
            dedicated_size: CONTAINER_SIZE,
            max_record_size: MAX_RECORD_SIZE,
        })
        .await
        .unwrap()
}

fn plain_request(asn: u64, size: usize) -> WriteRequest {
    WriteRequest::new(asn, 1, Arc::from(vec![0u8; 64]), Arc::from(vec![7u8; size]))
}

// ============================================================================
// Header Codec Benchmarks
// ============================================================================

fn bench_header_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("header");
    let stream_id = StreamId::new_v4();

    for size in [64usize, 4096, 65536] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode_record", size), &payload, |b, payload| {
            b.iter(|| black_box(encode_record(stream_id, 1, 1, payload, true, 4096)));
        });

        let (metadata, data) = encode_record(stream_id, 1, 1, &payload, true, 4096);
        group.bench_with_input(BenchmarkId::new("parse_and_verify", size), &size, |b, _| {
            b.iter(|| {
                let header = LogicalLogHeader::parse(&metadata).unwrap();
                header.verify_data(&metadata, &data).unwrap();
                black_box(header)
            });
        });
    }

    group.finish();
}

// ============================================================================
// Write Benchmarks
// ============================================================================

fn bench_plain_write(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("plain_write");

    for size in [256usize, 1024, 4096] {
        let overlay = overlay(OverlayConfig::default());
        let stream = rt.block_on(open_stream(&overlay, LogStreamType::Plain));
        let next_asn = AtomicU64::new(1);
        let (stream, next_asn) = (&stream, &next_asn);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(move || async move {
                let asn = next_asn.fetch_add(1, Ordering::Relaxed);
                black_box(stream.write(plain_request(asn, size)).await.unwrap())
            });
        });
    }

    group.finish();
}

fn bench_logical_write(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("logical_write");
    let payload = vec![0x33u8; 512];
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for coalescing in [true, false] {
        let config = OverlayConfig {
            coalescing_enabled: coalescing,
            ..Default::default()
        };
        let overlay = overlay(config);
        let stream = rt.block_on(open_stream(&overlay, LogStreamType::Logical));
        let stream_id = stream.stream_id();
        let next_version = AtomicU64::new(1);
        let label = if coalescing { "coalesced" } else { "direct" };
        let (stream, next_version, payload) = (&stream, &next_version, &payload);

        group.bench_function(label, |b| {
            b.to_async(&rt).iter(move || async move {
                let version = next_version.fetch_add(1, Ordering::Relaxed);
                let asn = 1 + (version - 1) * payload.len() as u64;
                let (metadata, data) = encode_record(stream_id, asn, version, &payload, true, 4096);
                black_box(
                    stream
                        .write(WriteRequest::new(asn, version, metadata, data))
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

// ============================================================================
// Read Benchmarks
// ============================================================================

fn bench_reads(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("read");
    let record_count = 1000u64;

    let plain_overlay = overlay(OverlayConfig::default());
    let plain = rt.block_on(async {
        let stream = open_stream(&plain_overlay, LogStreamType::Plain).await;
        for asn in 1..=record_count {
            stream.write(plain_request(asn, 1024)).await.unwrap();
        }
        stream
    });

    let plain = &plain;
    group.bench_function("plain_exact", |b| {
        let mut asn = 0;
        b.to_async(&rt).iter(move || {
            asn = asn % record_count + 1;
            async move { black_box(plain.read(asn, ReadMode::Exact).await.unwrap()) }
        });
    });

    let logical_overlay = overlay(OverlayConfig {
        coalescing_enabled: false,
        ..Default::default()
    });
    let payload = vec![0x42u8; 256];
    let logical = rt.block_on(async {
        let stream = open_stream(&logical_overlay, LogStreamType::Logical).await;
        let id = stream.stream_id();
        for version in 1..=record_count {
            let asn = 1 + (version - 1) * payload.len() as u64;
            let (metadata, data) = encode_record(id, asn, version, &payload, true, 4096);
            stream
                .write(WriteRequest::new(asn, version, metadata, data))
                .await
                .unwrap();
        }
        stream
    });
    let tail = logical.logical_tail();

    let logical = &logical;
    group.bench_function("logical_containing", |b| {
        let mut offset = 0;
        b.to_async(&rt).iter(move || {
            offset = (offset + 997) % (tail - 1) + 1;
            async move { black_box(logical.read(offset, ReadMode::Containing).await.unwrap()) }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_header_codec,
    bench_plain_write,
    bench_logical_write,
    bench_reads,
);
criterion_main!(benches);
