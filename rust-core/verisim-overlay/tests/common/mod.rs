// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shared fixtures for overlay integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use verisim_logstore::{
    ContainerId, InMemoryLogContainer, InMemoryLogFactory, InMemoryLogStream, LogStreamType,
    StreamId,
};
use verisim_overlay::header::build_record;
use verisim_overlay::{
    encode_record, LogicalLogHeader, OverlayConfig, OverlayLog, OverlayStream,
    OverlayStreamOptions, WriteRequest,
};

pub const SHARED_SIZE: u64 = 64 * 1024 * 1024;
pub const DEDICATED_SIZE: u64 = 16 * 1024 * 1024;
pub const MAX_RECORD_SIZE: u64 = 1024 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

/// Short timers so background flushes and retries happen quickly.
pub fn test_config() -> OverlayConfig {
    OverlayConfig {
        coalesce_flush_period_ms: 5,
        log_full_retry_delay_ms: 5,
        ..Default::default()
    }
}

/// Configuration that writes every logical record straight to the
/// dedicated log.
pub fn uncoalesced_config() -> OverlayConfig {
    OverlayConfig {
        coalescing_enabled: false,
        ..test_config()
    }
}

pub struct Harness {
    pub factory: Arc<InMemoryLogFactory>,
    pub shared: Arc<InMemoryLogContainer>,
    pub overlay: OverlayLog,
}

impl Harness {
    pub fn new(config: OverlayConfig) -> Self {
        init_tracing();
        let factory = Arc::new(InMemoryLogFactory::new());
        let shared = Arc::new(InMemoryLogContainer::new(
            ContainerId::new_v4(),
            None,
            SHARED_SIZE,
            MAX_RECORD_SIZE,
        ));
        let overlay = OverlayLog::new(shared.clone(), factory.clone(), config).unwrap();
        Self {
            factory,
            shared,
            overlay,
        }
    }

    pub async fn create(&self, stream_type: LogStreamType, path: Option<&str>) -> Arc<OverlayStream> {
        self.overlay
            .create_stream(OverlayStreamOptions {
                stream_id: StreamId::new_v4(),
                stream_type,
                dedicated_path: path.map(str::to_string),
                dedicated_size: DEDICATED_SIZE,
                max_record_size: MAX_RECORD_SIZE,
            })
            .await
            .unwrap()
    }

    /// The in-memory shared stream behind an overlay stream.
    pub async fn shared_log(&self, stream_id: StreamId) -> Arc<InMemoryLogStream> {
        self.shared.stream(stream_id).await.unwrap()
    }

    /// The in-memory dedicated stream behind an overlay stream.
    pub async fn dedicated_log(&self, stream_id: StreamId) -> Arc<InMemoryLogStream> {
        self.factory
            .container(ContainerId::dedicated_for(stream_id))
            .await
            .unwrap()
            .stream(stream_id)
            .await
            .unwrap()
    }
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// A logical-log write request carrying `payload`.
pub fn logical_write(
    stream_id: StreamId,
    asn: u64,
    version: u64,
    payload: &[u8],
    end_of_record: bool,
) -> WriteRequest {
    let (metadata, data) = encode_record(stream_id, asn, version, payload, end_of_record, 4096);
    WriteRequest::new(asn, version, metadata, data)
}

/// A plain write request with distinct metadata and data.
pub fn plain_write(asn: u64, version: u64) -> WriteRequest {
    WriteRequest::new(
        asn,
        version,
        Arc::from(payload(32, asn as u8)),
        Arc::from(payload(256, version as u8)),
    )
}

/// Physical logical-log record buffers as the write path would store them
/// for an end-of-record write.
pub fn logical_record(
    stream_id: StreamId,
    asn: u64,
    version: u64,
    payload: &[u8],
) -> (verisim_logstore::SharedBuffer, verisim_logstore::SharedBuffer) {
    let mut header = LogicalLogHeader::new(stream_id, asn, version, payload, true);
    header.mark_record_end(payload.len() as u32);
    build_record(&header, payload, 4096)
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
