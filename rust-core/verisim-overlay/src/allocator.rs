// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Throttled buffer allocator
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounds the memory held by coalesce buffers across every stream of one
// overlay log. Capacity is counted in KiB units on a tokio semaphore; a
// write waits for its units before it is dispatched, which is where memory
// pressure pushes back on callers. Each open stream adds a quota to the
// limit and removes it again on close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{OverlayError, OverlayResult};

const UNIT: u64 = 1024;

fn units_for(bytes: u64) -> u64 {
    bytes.div_ceil(UNIT).max(1)
}

/// Buffer memory held by one in-flight write. Released on drop.
#[derive(Debug)]
pub struct BufferPermit {
    _permit: OwnedSemaphorePermit,
    bytes: u64,
}

impl BufferPermit {
    /// Bytes this permit accounts for, rounded up to whole units.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// A stream's contribution to the allocator limit.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamAllocation {
    units: u64,
}

/// Shared, limit-bounded allocator for coalesce buffers.
#[derive(Debug)]
pub struct ThrottledAllocator {
    semaphore: Arc<Semaphore>,
    limit_units: AtomicU64,
    stream_quota_units: u64,
    pressure_percent: u8,
}

impl ThrottledAllocator {
    /// An allocator starting at `base_limit` bytes that grows by
    /// `stream_quota` bytes per open stream.
    pub fn new(base_limit: u64, stream_quota: u64, pressure_percent: u8) -> Self {
        let base_units = base_limit / UNIT;
        Self {
            semaphore: Arc::new(Semaphore::new(base_units as usize)),
            limit_units: AtomicU64::new(base_units),
            stream_quota_units: stream_quota / UNIT,
            pressure_percent,
        }
    }

    /// Grow the limit by one stream quota.
    pub fn add_to_limit(&self) -> StreamAllocation {
        let units = self.stream_quota_units;
        self.semaphore.add_permits(units as usize);
        let limit = self.limit_units.fetch_add(units, Ordering::AcqRel) + units;
        debug!(limit_kib = limit, "Allocator limit raised");
        StreamAllocation { units }
    }

    /// Shrink the limit by a quota previously added. Waits for buffers
    /// using that capacity to be released.
    pub async fn remove_from_limit(&self, allocation: StreamAllocation) {
        if allocation.units == 0 {
            return;
        }
        let Ok(units) = u32::try_from(allocation.units) else {
            warn!(units = allocation.units, "Stream allocation too large to remove");
            return;
        };
        match self.semaphore.acquire_many(units).await {
            Ok(permit) => {
                permit.forget();
                self.limit_units.fetch_sub(allocation.units, Ordering::AcqRel);
            }
            Err(_) => warn!("Allocator closed while removing stream allocation"),
        }
    }

    /// Wait for `bytes` of buffer capacity.
    pub async fn allocate(&self, bytes: u64) -> OverlayResult<BufferPermit> {
        let units = units_for(bytes);
        let limit = self.limit_units.load(Ordering::Acquire);
        if units > limit {
            return Err(OverlayError::InsufficientResources(format!(
                "buffer of {bytes} bytes exceeds allocator limit of {} bytes",
                limit * UNIT
            )));
        }
        let wanted = u32::try_from(units).map_err(|_| {
            OverlayError::InsufficientResources(format!("buffer of {bytes} bytes"))
        })?;
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| OverlayError::InsufficientResources("allocator closed".to_string()))?;
        Ok(BufferPermit {
            _permit: permit,
            bytes: units * UNIT,
        })
    }

    /// Current limit in bytes.
    pub fn limit(&self) -> u64 {
        self.limit_units.load(Ordering::Acquire) * UNIT
    }

    /// Bytes not currently allocated.
    pub fn available(&self) -> u64 {
        self.semaphore.available_permits() as u64 * UNIT
    }

    /// True when free capacity has fallen below the pressure percentage.
    pub fn is_under_memory_pressure(&self) -> bool {
        let limit = self.limit_units.load(Ordering::Acquire);
        let available = self.semaphore.available_permits() as u64;
        available * 100 < limit * u64::from(self.pressure_percent)
    }
}
