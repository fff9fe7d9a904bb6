// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Reads
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Plain streams resolve each read against both logs and return the
// authoritative copy. Logical-log streams read from the coalesce buffer or
// the dedicated log and trim the returned record so it never exposes bytes
// past the logical tail or bytes superseded by a later truncate-tail write.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use verisim_logstore::{Asn, LogRecord, LogStream, ReadMode, RecordInfo};

use crate::error::{OverlayError, OverlayResult};
use crate::header::{build_record, crc64, LogicalLogHeader};
use crate::stream::{OverlayStream, StreamLogs};

/// Where a returned record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSource {
    Shared,
    Dedicated,
    /// Buffered, not yet written to the dedicated log.
    CoalesceBuffer,
}

/// A record returned by an overlay read.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    pub record: LogRecord,
    pub source: RecordSource,
}

impl OverlayStream {
    /// Read the record selected by `asn` and `mode`.
    ///
    /// Logical-log streams accept only [`ReadMode::Exact`] and
    /// [`ReadMode::Containing`].
    pub async fn read(&self, asn: Asn, mode: ReadMode) -> OverlayResult<ReadRecord> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        if self.is_logical() {
            self.read_logical(&logs, asn, mode).await
        } else {
            self.read_plain(&logs, asn, mode).await
        }
    }

    // -----------------------------------------------------------------------
    // Plain streams
    // -----------------------------------------------------------------------

    async fn read_plain(&self, logs: &StreamLogs, asn: Asn, mode: ReadMode) -> OverlayResult<ReadRecord> {
        // Next and Previous need the anchor in at least one log; after that
        // each log is searched from the ASN whether it holds the anchor or not.
        let mode = match mode {
            ReadMode::Next | ReadMode::Previous => {
                let shared = logs.shared.query_record(asn, ReadMode::Exact).await?;
                let dedicated = logs.dedicated.query_record(asn, ReadMode::Exact).await?;
                if !shared.is_persisted() && !dedicated.is_persisted() {
                    return Err(OverlayError::NotFound(asn));
                }
                if mode == ReadMode::Next {
                    ReadMode::NextFromSpecificAsn
                } else {
                    ReadMode::PreviousFromSpecificAsn
                }
            }
            other => other,
        };

        let shared = persisted_or_none(logs.shared.query_record(asn, mode).await?);
        let dedicated = persisted_or_none(logs.dedicated.query_record(asn, mode).await?);
        let (chosen, source) = match (shared.is_none(), dedicated.is_none()) {
            (true, true) => return Err(OverlayError::NotFound(asn)),
            (false, true) => (shared, RecordSource::Shared),
            (true, false) => (dedicated, RecordSource::Dedicated),
            (false, false) => pick_plain(mode, shared, dedicated),
        };

        if source == RecordSource::Shared {
            match logs.shared.read(chosen.asn, ReadMode::Exact).await {
                Ok(record) => return Ok(ReadRecord { record, source }),
                Err(err) => {
                    debug!(
                        stream_id = %self.stream_id,
                        asn = chosen.asn,
                        error = %err,
                        "Shared read failed; reading dedicated copy"
                    );
                }
            }
        }
        let record = logs.dedicated.read(chosen.asn, ReadMode::Exact).await?;
        Ok(ReadRecord {
            record,
            source: RecordSource::Dedicated,
        })
    }

    // -----------------------------------------------------------------------
    // Logical-log streams
    // -----------------------------------------------------------------------

    async fn read_logical(&self, logs: &StreamLogs, asn: Asn, mode: ReadMode) -> OverlayResult<ReadRecord> {
        if !matches!(mode, ReadMode::Exact | ReadMode::Containing) {
            return Err(OverlayError::NotSupported(format!(
                "{mode:?} reads on a logical log stream"
            )));
        }
        if asn >= self.logical_tail() {
            return Err(OverlayError::NotFound(asn));
        }
        let range = logs.dedicated.query_record_range().await?;
        if !range.is_empty() && asn < range.low {
            return Err(OverlayError::NotFound(asn));
        }

        let attempts = self.config.read_retry_limit;
        for attempt in 1..=attempts {
            let buffered = self
                .coalescer(logs)
                .and_then(|coalescer| coalescer.read(asn, mode));
            let (record, source) = match buffered {
                Some(record) => (record, RecordSource::CoalesceBuffer),
                None => match logs.dedicated.read(asn, mode).await {
                    Ok(record) => (record, RecordSource::Dedicated),
                    Err(err) if err.is_not_found() => return Err(OverlayError::NotFound(asn)),
                    Err(err) => {
                        debug!(stream_id = %self.stream_id, asn, attempt, error = %err, "Logical read retry");
                        continue;
                    }
                },
            };

            let header = LogicalLogHeader::parse(&record.metadata)?;
            header.verify_data(&record.metadata, &record.data)?;
            let full_end = record.asn + u64::from(header.data_size);
            if asn >= full_end {
                // A flush moved the record between the buffer and the log.
                debug!(stream_id = %self.stream_id, asn, attempt, "Logical read raced a flush");
                continue;
            }

            let end = self.trimmed_end(logs, &record, full_end).await?;
            if asn >= end {
                debug!(stream_id = %self.stream_id, asn, end, attempt, "Logical read past trimmed end");
                continue;
            }
            let record = if end < full_end {
                trim_record(&record, header, end)?
            } else {
                record
            };
            return Ok(ReadRecord { record, source });
        }

        warn!(stream_id = %self.stream_id, asn, attempts, "Logical read gave up");
        Err(OverlayError::NotFound(asn))
    }

    /// End of the valid bytes of `record`: the ASN of the first later record
    /// with a higher version, capped at the logical tail.
    async fn trimmed_end(&self, logs: &StreamLogs, record: &LogRecord, full_end: Asn) -> OverlayResult<Asn> {
        let mut end = full_end;
        let mut cursor = record.asn;
        loop {
            let next = logs
                .dedicated
                .query_record(cursor, ReadMode::NextFromSpecificAsn)
                .await?;
            if next.is_none() || next.asn >= end {
                break;
            }
            if next.is_persisted() && next.version > record.version {
                end = next.asn;
                break;
            }
            if next.version >= record.version {
                break;
            }
            cursor = next.asn;
        }
        Ok(end.min(self.logical_tail()))
    }
}

fn persisted_or_none(info: RecordInfo) -> RecordInfo {
    if info.is_persisted() {
        info
    } else {
        RecordInfo::none(info.asn)
    }
}

/// Choose between records found in both logs.
fn pick_plain(mode: ReadMode, shared: RecordInfo, dedicated: RecordInfo) -> (RecordInfo, RecordSource) {
    let shared_wins = if shared.asn == dedicated.asn {
        shared.version > dedicated.version
    } else {
        match mode {
            ReadMode::Next | ReadMode::NextFromSpecificAsn => shared.asn < dedicated.asn,
            ReadMode::Previous | ReadMode::PreviousFromSpecificAsn => shared.asn > dedicated.asn,
            ReadMode::Containing | ReadMode::Exact => {
                shared.version > dedicated.version
                    || (shared.version == dedicated.version && shared.asn > dedicated.asn)
            }
        }
    };
    if shared_wins {
        (shared, RecordSource::Shared)
    } else {
        (dedicated, RecordSource::Dedicated)
    }
}

/// Rebuild `record` carrying only the bytes before `end`.
fn trim_record(record: &LogRecord, mut header: LogicalLogHeader, end: Asn) -> OverlayResult<LogRecord> {
    let payload = header.payload(&record.metadata, &record.data)?;
    let keep = (end - record.asn) as usize;
    let kept = &payload[..keep.min(payload.len())];

    header.data_size = kept.len() as u32;
    header.data_crc = crc64(kept);
    if header.record_marker_offset_plus_one > header.data_size + 1 {
        header.mark_record_end(header.data_size);
    }
    let (metadata, data) = build_record(&header, kept, record.metadata.len() as u32);
    Ok(LogRecord {
        asn: record.asn,
        version: record.version,
        metadata,
        data,
    })
}
