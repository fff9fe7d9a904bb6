// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Metadata block and reservations
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use tracing::{debug, warn};
use verisim_logstore::LogStream;

use crate::error::OverlayResult;
use crate::stream::OverlayStream;

impl OverlayStream {
    /// Replace the dedicated log's metadata block.
    pub async fn write_metadata(&self, block: Vec<u8>) -> OverlayResult<()> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        let bytes = block.len();
        logs.dedicated.write_metadata(block).await.inspect_err(|err| {
            warn!(stream_id = %self.stream_id, bytes, error = %err, "Metadata write failed");
        })?;
        Ok(())
    }

    /// Read the dedicated log's metadata block.
    pub async fn read_metadata(&self) -> OverlayResult<Vec<u8>> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        Ok(logs.dedicated.read_metadata().await?)
    }

    /// Grow or shrink the dedicated log reservation by `delta` bytes.
    /// Reserved space counts as neither used nor free.
    pub async fn update_reservation(&self, delta: i64) -> OverlayResult<()> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        logs.dedicated.update_reservation(delta).await?;
        debug!(stream_id = %self.stream_id, delta, "Reservation updated");
        Ok(())
    }

    /// Bytes currently reserved in the dedicated log.
    pub async fn reservation_space(&self) -> OverlayResult<u64> {
        let _guard = self.request_refs().try_acquire()?;
        Ok(self.logs()?.dedicated.reservation_space().await)
    }
}
