// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Log usage threshold notifications
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{OverlayError, OverlayResult};

/// One-shot registrations fired when dedicated log usage reaches a
/// percentage.
#[derive(Debug, Default)]
pub struct ThresholdNotifications {
    pending: Mutex<Vec<(u32, oneshot::Sender<u32>)>>,
}

impl ThresholdNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for a notification once usage reaches `percent`. The
    /// receiver yields the usage observed when it fired.
    pub fn register(&self, percent: u32) -> OverlayResult<oneshot::Receiver<u32>> {
        if percent > 100 {
            return Err(OverlayError::InvalidParameter(format!(
                "threshold {percent}% is not a percentage"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((percent, tx));
        Ok(rx)
    }

    /// Fire every registration at or below `percent_used`.
    pub fn check(&self, percent_used: u32) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fired = 0;
        let mut kept = Vec::with_capacity(pending.len());
        for (threshold, tx) in pending.drain(..) {
            if threshold <= percent_used {
                if tx.send(percent_used).is_ok() {
                    fired += 1;
                }
            } else if !tx.is_closed() {
                kept.push((threshold, tx));
            }
        }
        *pending = kept;
        if fired > 0 {
            debug!(percent_used, fired, "Fired log usage notifications");
        }
        fired
    }

    /// Drop every registration; receivers observe a closed channel.
    pub fn cancel_all(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_at_or_below_usage() {
        let notifications = ThresholdNotifications::new();
        let mut low = notifications.register(10).unwrap();
        let mut high = notifications.register(80).unwrap();

        assert_eq!(notifications.check(50), 1);
        assert_eq!(low.try_recv().unwrap(), 50);
        assert!(high.try_recv().is_err());
        assert_eq!(notifications.len(), 1);

        assert_eq!(notifications.check(80), 1);
        assert_eq!(high.try_recv().unwrap(), 80);
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_abandoned_registration_is_dropped() {
        let notifications = ThresholdNotifications::new();
        drop(notifications.register(90).unwrap());
        notifications.check(5);
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_rejects_invalid_percentage() {
        let notifications = ThresholdNotifications::new();
        assert!(notifications.register(101).is_err());
    }
}
