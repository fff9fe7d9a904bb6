// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Control requests
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Out-of-band control and query requests on an open stream. Requests arrive
// either as typed values or as a numeric code plus a little-endian payload
// decoded by `IoctlRequest::from_code`.

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use verisim_logstore::Asn;

use crate::config::{WRITE_THROTTLE_THRESHOLD_MINIMUM, WRITE_THROTTLE_THRESHOLD_NO_LIMIT};
use crate::error::{OverlayError, OverlayResult};
use crate::header::LogicalLogHeader;
use crate::stats::TelemetrySnapshot;
use crate::stream::OverlayStream;

/// Numeric request codes.
pub mod codes {
    pub const QUERY_LOGICAL_LOG_TAIL_ASN_AND_HIGHEST_OPERATION: u32 = 0x01;
    pub const WRITE_ONLY_TO_DEDICATED_LOG: u32 = 0x02;
    pub const WRITE_TO_SHARED_AND_DEDICATED_LOG: u32 = 0x03;
    pub const QUERY_CURRENT_WRITE_INFORMATION: u32 = 0x04;
    pub const QUERY_CURRENT_BUILD_INFORMATION: u32 = 0x05;
    pub const QUERY_CURRENT_LOG_USAGE_INFORMATION: u32 = 0x06;
    pub const QUERY_LOG_SIZE_AND_SPACE_REMAINING: u32 = 0x07;
    pub const SET_WRITE_THROTTLE_THRESHOLD: u32 = 0x08;
    pub const DELAY_SHARED_WRITES: u32 = 0x09;
    pub const DELAY_DEDICATED_WRITES: u32 = 0x0A;
    pub const DISABLE_COALESCING_WRITES: u32 = 0x0B;
    pub const ENABLE_COALESCING_WRITES: u32 = 0x0C;
    pub const SET_SHARED_TRUNCATION_ASN: u32 = 0x0D;
    pub const QUERY_LOGICAL_LOG_READ_INFORMATION: u32 = 0x0E;
    pub const QUERY_TELEMETRY_STATISTICS: u32 = 0x0F;
    pub const QUERY_ACCELERATED_FLUSH_MODE: u32 = 0x10;
}

/// A control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoctlRequest {
    QueryLogicalLogTailAsnAndHighestOperation,
    WriteOnlyToDedicatedLog,
    WriteToSharedAndDedicatedLog,
    QueryCurrentWriteInformation,
    QueryCurrentBuildInformation,
    QueryCurrentLogUsageInformation,
    QueryLogSizeAndSpaceRemaining,
    /// New dedicated write-throttle threshold in bytes.
    SetWriteThrottleThreshold(u64),
    /// Delay before each shared write, in milliseconds. Zero disables.
    DelaySharedWrites(u64),
    /// Delay before each dedicated write, in milliseconds. Zero disables.
    DelayDedicatedWrites(u64),
    DisableCoalescingWrites,
    EnableCoalescingWrites,
    SetSharedTruncationAsn(Asn),
    QueryLogicalLogReadInformation,
    QueryTelemetryStatistics,
    QueryAcceleratedFlushMode,
}

impl IoctlRequest {
    /// Decode a request from its code and payload. Requests carrying a
    /// value expect it as the first eight bytes, little-endian.
    pub fn from_code(code: u32, payload: &[u8]) -> OverlayResult<Self> {
        use codes::*;

        let value = || -> OverlayResult<u64> {
            let bytes: [u8; 8] = payload
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(OverlayError::BufferTooSmall {
                    needed: 8,
                    available: payload.len() as u64,
                })?;
            Ok(u64::from_le_bytes(bytes))
        };

        Ok(match code {
            QUERY_LOGICAL_LOG_TAIL_ASN_AND_HIGHEST_OPERATION => {
                Self::QueryLogicalLogTailAsnAndHighestOperation
            }
            WRITE_ONLY_TO_DEDICATED_LOG => Self::WriteOnlyToDedicatedLog,
            WRITE_TO_SHARED_AND_DEDICATED_LOG => Self::WriteToSharedAndDedicatedLog,
            QUERY_CURRENT_WRITE_INFORMATION => Self::QueryCurrentWriteInformation,
            QUERY_CURRENT_BUILD_INFORMATION => Self::QueryCurrentBuildInformation,
            QUERY_CURRENT_LOG_USAGE_INFORMATION => Self::QueryCurrentLogUsageInformation,
            QUERY_LOG_SIZE_AND_SPACE_REMAINING => Self::QueryLogSizeAndSpaceRemaining,
            SET_WRITE_THROTTLE_THRESHOLD => Self::SetWriteThrottleThreshold(value()?),
            DELAY_SHARED_WRITES => Self::DelaySharedWrites(value()?),
            DELAY_DEDICATED_WRITES => Self::DelayDedicatedWrites(value()?),
            DISABLE_COALESCING_WRITES => Self::DisableCoalescingWrites,
            ENABLE_COALESCING_WRITES => Self::EnableCoalescingWrites,
            SET_SHARED_TRUNCATION_ASN => Self::SetSharedTruncationAsn(value()?),
            QUERY_LOGICAL_LOG_READ_INFORMATION => Self::QueryLogicalLogReadInformation,
            QUERY_TELEMETRY_STATISTICS => Self::QueryTelemetryStatistics,
            QUERY_ACCELERATED_FLUSH_MODE => Self::QueryAcceleratedFlushMode,
            unknown => {
                return Err(OverlayError::InvalidParameter(format!(
                    "unknown control code {unknown:#x}"
                )))
            }
        })
    }

    /// The numeric code of this request.
    pub fn code(&self) -> u32 {
        use codes::*;

        match self {
            Self::QueryLogicalLogTailAsnAndHighestOperation => {
                QUERY_LOGICAL_LOG_TAIL_ASN_AND_HIGHEST_OPERATION
            }
            Self::WriteOnlyToDedicatedLog => WRITE_ONLY_TO_DEDICATED_LOG,
            Self::WriteToSharedAndDedicatedLog => WRITE_TO_SHARED_AND_DEDICATED_LOG,
            Self::QueryCurrentWriteInformation => QUERY_CURRENT_WRITE_INFORMATION,
            Self::QueryCurrentBuildInformation => QUERY_CURRENT_BUILD_INFORMATION,
            Self::QueryCurrentLogUsageInformation => QUERY_CURRENT_LOG_USAGE_INFORMATION,
            Self::QueryLogSizeAndSpaceRemaining => QUERY_LOG_SIZE_AND_SPACE_REMAINING,
            Self::SetWriteThrottleThreshold(_) => SET_WRITE_THROTTLE_THRESHOLD,
            Self::DelaySharedWrites(_) => DELAY_SHARED_WRITES,
            Self::DelayDedicatedWrites(_) => DELAY_DEDICATED_WRITES,
            Self::DisableCoalescingWrites => DISABLE_COALESCING_WRITES,
            Self::EnableCoalescingWrites => ENABLE_COALESCING_WRITES,
            Self::SetSharedTruncationAsn(_) => SET_SHARED_TRUNCATION_ASN,
            Self::QueryLogicalLogReadInformation => QUERY_LOGICAL_LOG_READ_INFORMATION,
            Self::QueryTelemetryStatistics => QUERY_TELEMETRY_STATISTICS,
            Self::QueryAcceleratedFlushMode => QUERY_ACCELERATED_FLUSH_MODE,
        }
    }
}

/// The answer to a control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoctlResponse {
    /// The request carries no answer.
    Done,
    LogicalLogTail {
        tail_asn: Asn,
        highest_operation_id: u64,
        max_block_size: u64,
        recovered_header: Option<LogicalLogHeader>,
    },
    WriteInformation {
        /// `ASN_MAX` when nothing is outstanding.
        lowest_outstanding_dedicated_asn: Asn,
    },
    BuildInformation {
        version: String,
        debug_build: bool,
    },
    LogUsage {
        percent_used: u32,
    },
    LogSizeAndSpaceRemaining {
        log_size: u64,
        space_remaining: u64,
    },
    PreviousThrottleThreshold(u64),
    PreviousDelayMillis(u64),
    PreviousSharedTruncationAsn(Asn),
    LogicalLogReadInformation {
        max_read_record_size: u64,
    },
    Telemetry(TelemetrySnapshot),
    AcceleratedFlushMode {
        under_pressure: bool,
    },
}

impl OverlayStream {
    /// Handle a control request.
    pub async fn ioctl(&self, request: IoctlRequest) -> OverlayResult<IoctlResponse> {
        let _guard = self.request_refs().try_acquire()?;
        let logs = self.logs()?;
        debug!(stream_id = %self.stream_id, ?request, "Control request");

        let logical_only = || {
            if self.is_logical() {
                Ok(())
            } else {
                Err(OverlayError::NotSupported(format!(
                    "{request:?} on a plain stream"
                )))
            }
        };

        Ok(match request {
            IoctlRequest::QueryLogicalLogTailAsnAndHighestOperation => {
                logical_only()?;
                IoctlResponse::LogicalLogTail {
                    tail_asn: self.logical_tail(),
                    highest_operation_id: self.last_version(),
                    max_block_size: logs.dedicated_container.max_record_size(),
                    recovered_header: self.recovered_header(),
                }
            }
            IoctlRequest::WriteOnlyToDedicatedLog => {
                self.write_only_to_dedicated.store(true, Ordering::Release);
                info!(stream_id = %self.stream_id, "Writing only to dedicated log");
                IoctlResponse::Done
            }
            IoctlRequest::WriteToSharedAndDedicatedLog => {
                self.write_only_to_dedicated.store(false, Ordering::Release);
                info!(stream_id = %self.stream_id, "Writing to shared and dedicated logs");
                IoctlResponse::Done
            }
            IoctlRequest::QueryCurrentWriteInformation => IoctlResponse::WriteInformation {
                lowest_outstanding_dedicated_asn: self.dedicated_writes.lowest_asn(),
            },
            IoctlRequest::QueryCurrentBuildInformation => IoctlResponse::BuildInformation {
                version: env!("CARGO_PKG_VERSION").to_string(),
                debug_build: cfg!(debug_assertions),
            },
            IoctlRequest::QueryCurrentLogUsageInformation => IoctlResponse::LogUsage {
                percent_used: self.log_usage().await?.percent_used,
            },
            IoctlRequest::QueryLogSizeAndSpaceRemaining => {
                let usage = self.log_usage().await?;
                IoctlResponse::LogSizeAndSpaceRemaining {
                    log_size: usage.log_size,
                    space_remaining: usage.space_remaining,
                }
            }
            IoctlRequest::SetWriteThrottleThreshold(threshold) => {
                if threshold != WRITE_THROTTLE_THRESHOLD_NO_LIMIT
                    && threshold < WRITE_THROTTLE_THRESHOLD_MINIMUM
                {
                    return Err(OverlayError::InvalidParameter(format!(
                        "write throttle threshold {threshold} below minimum {WRITE_THROTTLE_THRESHOLD_MINIMUM}"
                    )));
                }
                let previous = self.throttle.set_threshold(threshold);
                self.throttle.unthrottle_if_possible();
                info!(stream_id = %self.stream_id, previous, threshold, "Write throttle threshold changed");
                IoctlResponse::PreviousThrottleThreshold(previous)
            }
            IoctlRequest::DelaySharedWrites(millis) => IoctlResponse::PreviousDelayMillis(
                self.shared_write_delay_ms.swap(millis, Ordering::AcqRel),
            ),
            IoctlRequest::DelayDedicatedWrites(millis) => IoctlResponse::PreviousDelayMillis(
                self.dedicated_write_delay_ms.swap(millis, Ordering::AcqRel),
            ),
            IoctlRequest::DisableCoalescingWrites => {
                logical_only()?;
                let coalescer = self.coalescer(&logs);
                self.coalescing_disabled.store(true, Ordering::Release);
                if let Some(coalescer) = coalescer {
                    coalescer.flush().await?;
                }
                info!(stream_id = %self.stream_id, "Coalescing disabled");
                IoctlResponse::Done
            }
            IoctlRequest::EnableCoalescingWrites => {
                logical_only()?;
                self.coalescing_disabled.store(false, Ordering::Release);
                info!(stream_id = %self.stream_id, "Coalescing enabled");
                IoctlResponse::Done
            }
            IoctlRequest::SetSharedTruncationAsn(asn) => {
                let previous = self.replace_shared_truncation_asn(asn);
                info!(stream_id = %self.stream_id, previous, asn, "Shared truncation ASN replaced");
                IoctlResponse::PreviousSharedTruncationAsn(previous)
            }
            IoctlRequest::QueryLogicalLogReadInformation => {
                logical_only()?;
                IoctlResponse::LogicalLogReadInformation {
                    max_read_record_size: logs.dedicated_container.max_record_size(),
                }
            }
            IoctlRequest::QueryTelemetryStatistics => IoctlResponse::Telemetry(self.telemetry()),
            IoctlRequest::QueryAcceleratedFlushMode => IoctlResponse::AcceleratedFlushMode {
                under_pressure: self.is_under_pressure_to_flush(),
            },
        })
    }
}
