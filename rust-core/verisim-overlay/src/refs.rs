// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Request references
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every public operation holds a request reference while it touches stream
// state. Closing a stream refuses new references and then waits for the
// outstanding ones to drain before tearing anything down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{OverlayError, OverlayResult};

/// Counts in-flight operations on a stream.
#[derive(Debug, Default)]
pub struct RequestRefs {
    count: AtomicU64,
    closing: AtomicBool,
    drained: Notify,
}

impl RequestRefs {
    /// A fresh, open reference counter.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a reference, failing once the stream has begun closing.
    pub fn try_acquire(self: &Arc<Self>) -> OverlayResult<RequestRef> {
        if self.closing.load(Ordering::Acquire) {
            return Err(OverlayError::ObjectNoLongerExists);
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        let guard = RequestRef { refs: self.clone() };
        if self.closing.load(Ordering::Acquire) {
            // Close raced with us; the guard's drop releases the count.
            drop(guard);
            return Err(OverlayError::ObjectNoLongerExists);
        }
        Ok(guard)
    }

    /// Refuse further references. Returns true if close had already begun.
    pub fn begin_close(&self) -> bool {
        self.closing.swap(true, Ordering::AcqRel)
    }

    /// True once close has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// References currently held.
    pub fn outstanding(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Resolve once every reference has been released.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// A held request reference. Released on drop.
#[derive(Debug)]
pub struct RequestRef {
    refs: Arc<RequestRefs>,
}

impl Drop for RequestRef {
    fn drop(&mut self) {
        self.refs.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_acquire_and_release() {
        let refs = RequestRefs::new();
        let a = refs.try_acquire().unwrap();
        let b = refs.try_acquire().unwrap();
        assert_eq!(refs.outstanding(), 2);
        drop(a);
        drop(b);
        assert_eq!(refs.outstanding(), 0);
    }

    #[test]
    fn test_acquire_fails_after_close() {
        let refs = RequestRefs::new();
        assert!(!refs.begin_close());
        assert!(refs.begin_close());
        assert_eq!(
            refs.try_acquire().unwrap_err(),
            OverlayError::ObjectNoLongerExists
        );
        assert_eq!(refs.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_blocks_until_release() {
        let refs = RequestRefs::new();
        let held = refs.try_acquire().unwrap();
        refs.begin_close();

        let waiter = {
            let refs = refs.clone();
            tokio::spawn(async move { refs.wait_drained().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_drained_with_no_refs() {
        let refs = RequestRefs::new();
        refs.begin_close();
        refs.wait_drained().await;
    }
}
