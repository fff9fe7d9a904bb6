// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Write throttling
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Two independent gates hold writes back before they are dispatched:
//
// - `WriteThrottle` is per stream. It queues writes while the bytes of
//   dedicated writes in flight reach the stream's threshold.
// - `SharedLogBacklog` is shared by every stream on one shared log. It
//   queues writes while the shared container's free space is below a
//   threshold.
//
// A queued write holds the receiving half of a oneshot channel and resumes
// when the gate releases it. Both queues are FIFO. Dropping a queued write's
// receiver cancels it; the gate skips it when releasing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;
use verisim_logstore::LogContainer;

use crate::config::WRITE_THROTTLE_THRESHOLD_NO_LIMIT;

type WaitQueue = Mutex<VecDeque<oneshot::Sender<()>>>;

fn lock_queue(queue: &WaitQueue) -> MutexGuard<'_, VecDeque<oneshot::Sender<()>>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// WriteThrottle
// ---------------------------------------------------------------------------

/// Per-stream throttle on dedicated bytes outstanding.
#[derive(Debug)]
pub struct WriteThrottle {
    threshold: AtomicU64,
    bytes_outstanding: AtomicU64,
    waiting: WaitQueue,
}

impl WriteThrottle {
    /// A throttle engaging at `threshold` bytes outstanding.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: AtomicU64::new(threshold),
            bytes_outstanding: AtomicU64::new(0),
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    fn is_clear(&self) -> bool {
        let threshold = self.threshold.load(Ordering::Acquire);
        threshold == WRITE_THROTTLE_THRESHOLD_NO_LIMIT
            || self.bytes_outstanding.load(Ordering::Acquire) < threshold
    }

    /// Queue the caller if the threshold is reached. The returned receiver
    /// resolves when the write may proceed.
    pub fn should_throttle(&self) -> Option<oneshot::Receiver<()>> {
        let mut waiting = lock_queue(&self.waiting);
        if self.is_clear() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiting.push_back(tx);
        debug!(
            queued = waiting.len(),
            outstanding = self.bytes_outstanding.load(Ordering::Relaxed),
            "Throttled dedicated write"
        );
        Some(rx)
    }

    /// Release queued writes from the head while the threshold is clear.
    /// Returns how many were released.
    pub fn unthrottle_if_possible(&self) -> usize {
        let mut waiting = lock_queue(&self.waiting);
        let mut released = 0;
        while !waiting.is_empty() && self.is_clear() {
            if let Some(tx) = waiting.pop_front() {
                if tx.send(()).is_ok() {
                    released += 1;
                }
            }
        }
        released
    }

    /// Account for a dedicated write being dispatched.
    pub fn add_outstanding(&self, bytes: u64) {
        self.bytes_outstanding.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Account for a dedicated write completing.
    pub fn sub_outstanding(&self, bytes: u64) {
        let _ = self
            .bytes_outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Dedicated bytes currently in flight.
    pub fn bytes_outstanding(&self) -> u64 {
        self.bytes_outstanding.load(Ordering::Acquire)
    }

    /// Current threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Acquire)
    }

    /// Replace the threshold, returning the previous one.
    pub fn set_threshold(&self, threshold: u64) -> u64 {
        self.threshold.swap(threshold, Ordering::AcqRel)
    }

    /// Writes currently queued.
    pub fn waiting_count(&self) -> usize {
        lock_queue(&self.waiting).len()
    }
}

// ---------------------------------------------------------------------------
// SharedLogBacklog
// ---------------------------------------------------------------------------

/// Free-space throttle shared by every stream of one shared log.
pub struct SharedLogBacklog {
    container: Arc<dyn LogContainer>,
    free_space_threshold: u64,
    waiting: WaitQueue,
}

impl SharedLogBacklog {
    /// Throttle writes while `container` has less than
    /// `free_space_threshold` bytes free. A zero threshold disables it.
    pub fn new(container: Arc<dyn LogContainer>, free_space_threshold: u64) -> Self {
        Self {
            container,
            free_space_threshold,
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    async fn is_under_limit(&self) -> bool {
        self.container.space_info().await.free >= self.free_space_threshold
    }

    /// Queue the caller if the shared log is short of space.
    pub async fn should_throttle(&self) -> Option<oneshot::Receiver<()>> {
        if self.free_space_threshold == 0 || self.is_under_limit().await {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let mut waiting = lock_queue(&self.waiting);
        waiting.push_back(tx);
        debug!(queued = waiting.len(), "Throttled write on shared log backlog");
        Some(rx)
    }

    /// Release queued writes. The head is released unconditionally when
    /// `release_one` is set; after that, writes are released while the
    /// shared log has room.
    pub async fn should_unthrottle(&self, mut release_one: bool) -> usize {
        let mut released = 0;
        loop {
            if lock_queue(&self.waiting).is_empty() {
                return released;
            }
            let may_release = release_one || self.is_under_limit().await;
            if !may_release {
                return released;
            }
            let head = lock_queue(&self.waiting).pop_front();
            match head {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        released += 1;
                    }
                }
                None => return released,
            }
            release_one = false;
        }
    }

    /// Writes currently queued.
    pub fn waiting_count(&self) -> usize {
        lock_queue(&self.waiting).len()
    }
}
