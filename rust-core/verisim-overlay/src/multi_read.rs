// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Multi-record reads
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Logical-log readers prefer large reads. When the record containing the
// requested offset is too small, consecutive records are stitched into one
// synthetic record that starts exactly at the requested offset.

use serde::{Deserialize, Serialize};
use tracing::debug;
use verisim_logstore::{Asn, LogRecord, ReadMode};

use crate::error::{OverlayError, OverlayResult};
use crate::header::{build_record, LogicalLogHeader, HEADER_SIZE};
use crate::read::ReadRecord;
use crate::stream::OverlayStream;

/// Sizing for a multi-record read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRecordRead {
    /// A containing record holding at least this many logical bytes is
    /// returned as is.
    pub minimum_first_read: u64,
    /// Size of the caller's io buffer.
    pub io_size: u64,
}

impl OverlayStream {
    /// Read logical bytes starting at `asn`, gathering consecutive records
    /// until the caller's buffers are full.
    pub async fn read_multi_record(&self, asn: Asn, params: MultiRecordRead) -> OverlayResult<ReadRecord> {
        if !self.is_logical() {
            return Err(OverlayError::NotSupported(
                "multi-record reads on a plain stream".to_string(),
            ));
        }

        let first = self.read(asn, ReadMode::Containing).await?;
        let header = LogicalLogHeader::parse(&first.record.metadata)?;
        if u64::from(header.data_size) >= params.minimum_first_read
            && params.io_size >= first.record.data.len() as u64
        {
            return Ok(first);
        }

        let capacity = (self.config.fixed_metadata_size as usize).saturating_sub(HEADER_SIZE)
            + params.io_size as usize;
        let mut gathered: Vec<u8> = Vec::with_capacity(capacity);
        let mut record_end: Option<u32> = None;
        let mut next_asn = asn;
        let source = first.source;
        let mut current = Some(first);

        while gathered.len() < capacity {
            let read = match current.take() {
                Some(read) => read,
                None => match self.read(next_asn, ReadMode::Containing).await {
                    Ok(read) => read,
                    Err(err) if err.is_not_found() => break,
                    Err(err) => return Err(err),
                },
            };
            let header = LogicalLogHeader::parse(&read.record.metadata)?;
            let payload = header.payload(&read.record.metadata, &read.record.data)?;
            let skip = (next_asn - read.record.asn) as usize;
            if skip >= payload.len() {
                break;
            }

            let take = (payload.len() - skip).min(capacity - gathered.len());
            gathered.extend_from_slice(&payload[skip..skip + take]);
            let after = next_asn + take as u64;
            if let Some(end) = header.record_end_offset() {
                if end > asn && end <= after {
                    record_end = Some((end - asn) as u32);
                }
            }
            next_asn = after;
        }

        debug!(
            stream_id = %self.stream_id,
            asn,
            bytes = gathered.len(),
            "Multi-record read assembled"
        );

        let mut synthetic =
            LogicalLogHeader::new(self.stream_id, asn, header.highest_operation_id, &gathered, false);
        if let Some(end) = record_end {
            synthetic.mark_record_end(end);
        }
        let (metadata, data) = build_record(&synthetic, &gathered, self.config.fixed_metadata_size);
        Ok(ReadRecord {
            record: LogRecord {
                asn,
                version: header.highest_operation_id,
                metadata,
                data,
            },
            source,
        })
    }
}
