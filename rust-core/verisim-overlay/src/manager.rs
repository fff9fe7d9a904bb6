// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Overlay manager
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `OverlayLog` owns the shared container and the state every stream over it
// shares: the shared-log backlog throttle, the buffer allocator, and the
// gate that serializes stream opens. It creates, opens, closes and deletes
// overlay streams and keeps track of the open ones.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use verisim_logstore::{ContainerId, LogContainer, LogFactory, StreamId, StreamOptions};

use crate::allocator::ThrottledAllocator;
use crate::config::OverlayConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::stream::{OverlayStream, OverlayStreamOptions};
use crate::throttle::SharedLogBacklog;

/// Manager for the overlay streams layered over one shared container.
pub struct OverlayLog {
    shared_container: Arc<dyn LogContainer>,
    factory: Arc<dyn LogFactory>,
    config: Arc<OverlayConfig>,
    backlog: Arc<SharedLogBacklog>,
    allocator: Arc<ThrottledAllocator>,
    open_gate: Arc<Mutex<()>>,
    streams: Mutex<HashMap<StreamId, Arc<OverlayStream>>>,
}

impl std::fmt::Debug for OverlayLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayLog")
            .field("shared_container", &self.shared_container.container_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OverlayLog {
    /// A manager over `shared_container`, creating dedicated containers
    /// through `factory`.
    pub fn new(
        shared_container: Arc<dyn LogContainer>,
        factory: Arc<dyn LogFactory>,
        config: OverlayConfig,
    ) -> OverlayResult<Self> {
        config.validate()?;
        let backlog = Arc::new(SharedLogBacklog::new(
            shared_container.clone(),
            config.shared_throttle_free_space,
        ));
        let allocator = Arc::new(ThrottledAllocator::new(
            config.allocator_base_limit,
            config.allocator_stream_quota,
            config.memory_pressure_percent,
        ));
        Ok(Self {
            shared_container,
            factory,
            config: Arc::new(config),
            backlog,
            allocator,
            open_gate: Arc::new(Mutex::new(())),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// The shared-log free-space throttle.
    pub fn backlog(&self) -> &Arc<SharedLogBacklog> {
        &self.backlog
    }

    /// The coalesce buffer allocator.
    pub fn allocator(&self) -> &Arc<ThrottledAllocator> {
        &self.allocator
    }

    /// Create the shared stream and the dedicated container and stream, then
    /// open the new overlay stream.
    pub async fn create_stream(&self, options: OverlayStreamOptions) -> OverlayResult<Arc<OverlayStream>> {
        let stream_id = options.stream_id;
        let shared_max = self.shared_container.max_record_size();
        self.shared_container
            .create_stream(StreamOptions {
                stream_id,
                stream_type: options.stream_type,
                max_record_size: options.max_record_size.min(shared_max),
            })
            .await?;

        let container = self
            .factory
            .create_container(
                ContainerId::dedicated_for(stream_id),
                options.dedicated_path.as_deref(),
                options.dedicated_size,
                options.max_record_size,
            )
            .await?;
        let created = container
            .create_stream(StreamOptions {
                stream_id,
                stream_type: options.stream_type,
                max_record_size: options.max_record_size,
            })
            .await;
        container.close().await?;
        created?;

        info!(
            stream_id = %stream_id,
            stream_type = ?options.stream_type,
            dedicated_size = options.dedicated_size,
            "Overlay stream created"
        );
        self.open_stream(stream_id, options.dedicated_path).await
    }

    /// Open an existing overlay stream, or return it if already open.
    pub async fn open_stream(
        &self,
        stream_id: StreamId,
        dedicated_path: Option<String>,
    ) -> OverlayResult<Arc<OverlayStream>> {
        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(&stream_id) {
            return Ok(existing.clone());
        }

        let stream = OverlayStream::new(
            stream_id,
            self.config.clone(),
            self.shared_container.clone(),
            self.factory.clone(),
            self.backlog.clone(),
            self.allocator.clone(),
            self.open_gate.clone(),
            dedicated_path,
        );
        stream.open().await?;
        streams.insert(stream_id, stream.clone());
        Ok(stream)
    }

    /// Close an open stream.
    pub async fn close_stream(&self, stream_id: StreamId) -> OverlayResult<()> {
        let stream = self
            .streams
            .lock()
            .await
            .remove(&stream_id)
            .ok_or(OverlayError::ObjectNoLongerExists)?;
        stream.close().await
    }

    /// Delete a stream's shared stream and dedicated container. The stream
    /// is closed first if open.
    pub async fn delete_stream(&self, stream_id: StreamId) -> OverlayResult<()> {
        let open = self.streams.lock().await.remove(&stream_id);
        if let Some(stream) = open {
            if let Err(err) = stream.close().await {
                warn!(stream_id = %stream_id, error = %err, "Close before delete failed");
            }
        }
        self.shared_container.delete_stream(stream_id).await?;
        match self
            .factory
            .delete_container(ContainerId::dedicated_for(stream_id))
            .await
        {
            Err(err) if !err.is_not_found() => return Err(err.into()),
            _ => {}
        }
        info!(stream_id = %stream_id, "Overlay stream deleted");
        Ok(())
    }

    /// The open stream with this id.
    pub async fn stream(&self, stream_id: StreamId) -> Option<Arc<OverlayStream>> {
        self.streams.lock().await.get(&stream_id).cloned()
    }

    /// Number of open streams.
    pub async fn open_stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Close every open stream, reporting the first failure.
    pub async fn close_all(&self) -> OverlayResult<()> {
        let streams: Vec<_> = self.streams.lock().await.drain().map(|(_, s)| s).collect();
        let mut first_error = None;
        for stream in streams {
            if let Err(err) = stream.close().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
