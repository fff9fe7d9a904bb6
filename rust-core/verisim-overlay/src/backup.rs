// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Shared log backup
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Before the shared copy of a stream that failed reconciliation is
// discarded, its records are copied into a backup container next to the
// dedicated container so they can be inspected or replayed by hand.

use tracing::{info, warn};
use verisim_logstore::{ContainerId, LogStream, ReadMode, StreamOptions, WriteRecord};

use crate::error::OverlayResult;
use crate::stream::OverlayStream;

/// Per-record allowance added to each record when sizing a backup.
const BACKUP_RECORD_ALLOWANCE: u64 = 4096;

/// Capacity of a backup container for records totalling `record_bytes`.
pub fn backup_container_size(record_bytes: u64, growth_factor: f64, rounding: u64) -> u64 {
    let wanted = (record_bytes as f64 * growth_factor).ceil() as u64;
    wanted.div_ceil(rounding).max(1) * rounding
}

impl OverlayStream {
    /// Copy every record in `shared` into `<dedicated path><backup suffix>`.
    /// Streams without a dedicated path have nowhere to put a backup.
    pub(crate) async fn backup_shared_log(&self, shared: &dyn LogStream) -> OverlayResult<()> {
        let Some(path) = &self.dedicated_path else {
            warn!(stream_id = %self.stream_id, "No dedicated path; shared log not backed up");
            return Ok(());
        };
        let range = shared.query_record_range().await?;
        if range.is_empty() {
            return Ok(());
        }

        let records: Vec<_> = shared
            .query_records(range.low, range.high)
            .await?
            .into_iter()
            .filter(|info| info.is_persisted())
            .collect();
        let record_bytes: u64 = records
            .iter()
            .map(|info| BACKUP_RECORD_ALLOWANCE + info.total_size())
            .sum();
        let size = backup_container_size(
            record_bytes,
            self.config.backup_growth_factor,
            self.config.backup_size_rounding,
        );

        let backup_path = format!("{path}{}", self.config.backup_suffix);
        let max_record_size = self.shared_container.max_record_size();
        let container = self
            .factory
            .create_container(ContainerId::new_v4(), Some(&backup_path), size, max_record_size)
            .await?;
        let backup = container
            .create_stream(StreamOptions {
                stream_id: self.stream_id,
                stream_type: shared.stream_type(),
                max_record_size,
            })
            .await?;

        for info in &records {
            let record = shared.read(info.asn, ReadMode::Exact).await?;
            backup
                .write(WriteRecord {
                    reservation: 0,
                    asn: record.asn,
                    version: record.version,
                    metadata: record.metadata,
                    data: record.data,
                    force_flush: true,
                })
                .await?;
        }
        container.close().await?;

        info!(
            stream_id = %self.stream_id,
            path = %backup_path,
            records = records.len(),
            size,
            "Shared log records preserved in backup container"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_backup_size_rounds_up() {
        assert_eq!(backup_container_size(10_000, 1.5, 256 * MIB), 256 * MIB);
        assert_eq!(backup_container_size(200 * MIB, 1.5, 256 * MIB), 512 * MIB);
    }

    #[test]
    fn test_backup_size_never_zero() {
        assert_eq!(backup_container_size(0, 1.5, 256 * MIB), 256 * MIB);
    }
}
