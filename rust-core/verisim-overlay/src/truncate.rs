// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Caller truncation
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A caller truncation discards records before an ASN from both logs. For a
// logical-log stream the ASN is a logical offset: the record containing it
// must survive, so the truncation point moves back to the record before it.
// When that record cannot be found yet the truncation is parked on an
// outstanding write and retried when that write completes.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use verisim_logstore::{Asn, LogStream, ReadMode, VERSION_MAX};

use crate::error::{OverlayError, OverlayResult};
use crate::stream::{OverlayStream, StreamLogs};

/// What a truncation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncateOutcome {
    /// Both logs were truncated at this ASN.
    Applied(Asn),
    /// Parked until the outstanding write at `onto` completes.
    Deferred { onto: Asn },
    /// Nothing was truncated.
    Skipped,
}

impl OverlayStream {
    /// Truncate both logs before `asn`.
    pub async fn truncate(&self, asn: Asn) -> OverlayResult<TruncateOutcome> {
        let _guard = self.request_refs().try_acquire()?;
        if let Some(err) = self.failure_status() {
            debug!(stream_id = %self.stream_id, asn, error = %err, "Truncation skipped on failed stream");
            return Ok(TruncateOutcome::Skipped);
        }
        let logs = self.logs()?;

        let point = if self.is_logical() {
            match self.logical_truncation_point(&logs, asn).await? {
                Ok(point) => point,
                Err(outcome) => return Ok(outcome),
            }
        } else {
            asn
        };

        let must_stay_below = self.dedicated_writes.lowest_asn();
        if point >= must_stay_below {
            return Err(OverlayError::InvalidParameter(format!(
                "truncation at {point} reaches outstanding write at {must_stay_below}"
            )));
        }

        self.raise_shared_truncation(point, 0);
        logs.dedicated.truncate(point, point).await?;
        self.truncate_shared_if_possible(point, VERSION_MAX).await;

        info!(stream_id = %self.stream_id, requested = asn, point, "Overlay stream truncated");
        Ok(TruncateOutcome::Applied(point))
    }

    /// Map a logical offset to the ASN of the last record that lies wholly
    /// before it. `Err` carries the outcome when no such record is known.
    async fn logical_truncation_point(
        &self,
        logs: &StreamLogs,
        asn: Asn,
    ) -> OverlayResult<Result<Asn, TruncateOutcome>> {
        let tail = self.logical_tail();
        if asn > tail {
            return Err(OverlayError::InvalidParameter(format!(
                "truncation at {asn} past logical tail {tail}"
            )));
        }

        let containing = match logs.dedicated.query_record(asn, ReadMode::Containing).await {
            Ok(info) if !info.is_none() => info,
            other => {
                if let Err(err) = other {
                    debug!(stream_id = %self.stream_id, asn, error = %err, "Containing record lookup failed");
                }
                let outcome = match self.dedicated_writes.set_truncation_pending(asn) {
                    Some(onto) => TruncateOutcome::Deferred { onto },
                    None => TruncateOutcome::Skipped,
                };
                debug!(stream_id = %self.stream_id, asn, ?outcome, "Logical truncation not yet resolvable");
                return Ok(Err(outcome));
            }
        };

        // Walk back to the first predecessor no newer than the containing
        // record; anything newer was overwritten by it.
        let mut cursor = containing.asn;
        loop {
            let previous = logs.dedicated.query_record(cursor, ReadMode::Previous).await?;
            if previous.is_none() {
                return Ok(Err(TruncateOutcome::Skipped));
            }
            if previous.version <= containing.version {
                return Ok(Ok(previous.asn));
            }
            cursor = previous.asn;
        }
    }
}
