// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Log container and container factory traits.
//
// A container holds one or more log streams and owns their space. The shared
// log is a container hosting many streams; every dedicated log is a container
// hosting exactly one. Containers are located through a `LogFactory`, either
// by id or by path.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LogStoreResult;
use crate::stream::LogStream;
use crate::types::{ContainerId, LogStreamType, SpaceInfo, StreamId};

/// Parameters for creating a stream inside a container.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Identity of the new stream.
    pub stream_id: StreamId,
    /// Kind of data the stream will hold.
    pub stream_type: LogStreamType,
    /// Largest record the stream accepts.
    pub max_record_size: u64,
}

/// A physical log container.
#[async_trait]
pub trait LogContainer: Send + Sync {
    /// Identity of this container.
    fn container_id(&self) -> ContainerId;

    /// Path the container was created at, if any.
    fn path(&self) -> Option<String>;

    /// Largest record any stream in this container accepts.
    fn max_record_size(&self) -> u64;

    /// Bytes of system metadata the container adds in front of each record's
    /// metadata buffer.
    fn record_overhead(&self) -> u64;

    /// Open an existing stream.
    async fn open_stream(&self, stream_id: StreamId) -> LogStoreResult<Arc<dyn LogStream>>;

    /// Create a new stream.
    async fn create_stream(&self, options: StreamOptions) -> LogStoreResult<Arc<dyn LogStream>>;

    /// Delete a stream and release its space.
    async fn delete_stream(&self, stream_id: StreamId) -> LogStoreResult<()>;

    /// Current capacity and free space.
    async fn space_info(&self) -> SpaceInfo;

    /// Close the container. Resolves once the container has fully shut down.
    async fn close(&self) -> LogStoreResult<()>;
}

/// Locates, creates and deletes containers.
#[async_trait]
pub trait LogFactory: Send + Sync {
    /// Open an existing container by id.
    async fn open_container(&self, id: ContainerId) -> LogStoreResult<Arc<dyn LogContainer>>;

    /// Open an existing container by path.
    async fn open_container_at(&self, path: &str) -> LogStoreResult<Arc<dyn LogContainer>>;

    /// Create a container with `size` bytes of capacity, optionally bound to
    /// a path.
    async fn create_container(
        &self,
        id: ContainerId,
        path: Option<&str>,
        size: u64,
        max_record_size: u64,
    ) -> LogStoreResult<Arc<dyn LogContainer>>;

    /// Delete a container and everything in it.
    async fn delete_container(&self, id: ContainerId) -> LogStoreResult<()>;
}
