// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Open state machine
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Opening a stream brings the shared and dedicated logs back into agreement
// after a restart. Records still held only in the shared log are copied into
// the dedicated log, the logical tail is recovered, and background tasks
// are started. A dedicated log that cannot be reconciled with the shared log
// has its shared records preserved in a backup container before the stream's
// shared copy is discarded.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use verisim_logstore::{
    Asn, ContainerId, LogContainer, LogStoreError, LogStream, LogStreamType, MetricsLogStream,
    ReadMode, RecordRange, WriteRecord, ASN_MAX, ASN_MIN,
};

use crate::coalesce::CoalesceBuffer;
use crate::error::{OverlayError, OverlayResult};
use crate::header::{LogicalLogHeader, HEADER_SIZE};
use crate::refs::RequestRefs;
use crate::stream::{OverlayStream, StreamLogs, StreamState};

/// States of the open state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    Initial,
    AllocateResources,
    WaitForGate,
    OpenSharedStream,
    OpenDedicatedContainer,
    OpenDedicatedStream,
    VerifyContiguity,
    CopyFromSharedToDedicated,
    RecoverTailAsn,
    FinishOpen,
    BackupSharedLog,
    CleanupStreamResources,
    CloseDedicatedContainer,
    Completed,
}

/// Handles accumulated while the open runs.
#[derive(Default)]
struct OpenContext {
    shared: Option<Arc<MetricsLogStream>>,
    dedicated_container: Option<Arc<dyn LogContainer>>,
    dedicated: Option<Arc<MetricsLogStream>>,
    shared_range: Option<RecordRange>,
    failure: Option<OverlayError>,
}

impl OpenContext {
    fn shared(&self) -> OverlayResult<Arc<MetricsLogStream>> {
        self.shared.clone().ok_or(OverlayError::ObjectNoLongerExists)
    }

    fn dedicated(&self) -> OverlayResult<Arc<MetricsLogStream>> {
        self.dedicated.clone().ok_or(OverlayError::ObjectNoLongerExists)
    }

    fn dedicated_container(&self) -> OverlayResult<Arc<dyn LogContainer>> {
        self.dedicated_container
            .clone()
            .ok_or(OverlayError::ObjectNoLongerExists)
    }
}

impl OverlayStream {
    /// Run the open state machine. On failure the stream returns to
    /// [`StreamState::Closed`] and the first error is reported.
    pub(crate) async fn open(self: &Arc<Self>) -> OverlayResult<()> {
        self.set_state(StreamState::Opening);
        let mut ctx = OpenContext::default();
        let mut state = OpenState::Initial;
        let mut _gate = None;

        while state != OpenState::Completed {
            debug!(stream_id = %self.stream_id, ?state, "Open state");
            let step: OverlayResult<OpenState> = match state {
                OpenState::Initial => {
                    self.next_record_first_write.store(true, Ordering::Release);
                    Ok(OpenState::AllocateResources)
                }
                OpenState::AllocateResources => {
                    self.reset_for_open();
                    Ok(OpenState::WaitForGate)
                }
                OpenState::WaitForGate => {
                    _gate = Some(self.open_gate.clone().lock_owned().await);
                    Ok(OpenState::OpenSharedStream)
                }
                OpenState::OpenSharedStream => self.open_shared_stream(&mut ctx).await,
                OpenState::OpenDedicatedContainer => {
                    self.open_dedicated_container(&mut ctx).await
                }
                OpenState::OpenDedicatedStream => self.open_dedicated_stream(&mut ctx).await,
                OpenState::VerifyContiguity => self.verify_contiguity(&ctx).await,
                OpenState::CopyFromSharedToDedicated => self.copy_shared_to_dedicated(&mut ctx).await,
                OpenState::RecoverTailAsn => self.recover_tail(&ctx).await,
                OpenState::FinishOpen => self.finish_open(&mut ctx),
                OpenState::BackupSharedLog => match self.backup_from(&ctx).await {
                    Ok(()) => Ok(OpenState::CleanupStreamResources),
                    Err(err) => {
                        error!(stream_id = %self.stream_id, error = %err, "Shared log backup failed");
                        Ok(OpenState::CloseDedicatedContainer)
                    }
                },
                OpenState::CleanupStreamResources => {
                    if let Err(err) = self.shared_container.delete_stream(self.stream_id).await {
                        error!(stream_id = %self.stream_id, error = %err, "Shared stream cleanup failed");
                    }
                    Ok(OpenState::CloseDedicatedContainer)
                }
                OpenState::CloseDedicatedContainer => {
                    if let Some(container) = ctx.dedicated_container.take() {
                        if let Err(err) = container.close().await {
                            warn!(stream_id = %self.stream_id, error = %err, "Dedicated container close failed");
                        }
                    }
                    Ok(OpenState::Completed)
                }
                OpenState::Completed => Ok(OpenState::Completed),
            };

            state = match step {
                Ok(next) => next,
                Err(err) => self.route_open_failure(state, &mut ctx, err),
            };
        }

        match ctx.failure {
            Some(err) => {
                if let Some(shared) = ctx.shared.take() {
                    shared.set_truncation_completion_event(None).await;
                }
                self.set_state(StreamState::Closed);
                error!(stream_id = %self.stream_id, error = %err, "Overlay stream open failed");
                Err(err)
            }
            None => {
                info!(
                    stream_id = %self.stream_id,
                    logical = self.is_logical(),
                    tail = self.logical_tail(),
                    last_version = self.last_version(),
                    "Overlay stream opened"
                );
                Ok(())
            }
        }
    }

    /// Pick the recovery path for a failure in `state`.
    fn route_open_failure(
        &self,
        state: OpenState,
        ctx: &mut OpenContext,
        err: OverlayError,
    ) -> OpenState {
        warn!(stream_id = %self.stream_id, ?state, error = %err, "Open step failed");
        let dedicated_stage = matches!(
            state,
            OpenState::OpenDedicatedContainer
                | OpenState::OpenDedicatedStream
                | OpenState::VerifyContiguity
                | OpenState::CopyFromSharedToDedicated
                | OpenState::RecoverTailAsn
                | OpenState::FinishOpen
        );
        let next = if !dedicated_stage {
            OpenState::Completed
        } else if err.is_not_found() {
            OpenState::CleanupStreamResources
        } else if err.is_structure_fault() {
            OpenState::BackupSharedLog
        } else if ctx.dedicated_container.is_some() {
            OpenState::CloseDedicatedContainer
        } else {
            OpenState::Completed
        };
        ctx.failure.get_or_insert(err);
        next
    }

    fn reset_for_open(&self) {
        *self.refs.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = RequestRefs::new();
        *self
            .shared_truncation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = (0, 0);
        *self
            .recovered_header
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        *self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.set_last_shared_status(None);
        self.set_tail(ASN_MIN);
        self.last_version.store(0, Ordering::Release);
        self.write_only_to_dedicated
            .store(self.config.write_only_to_dedicated, Ordering::Release);
        self.coalescing_disabled
            .store(!self.config.coalescing_enabled, Ordering::Release);
    }

    async fn backup_from(&self, ctx: &OpenContext) -> OverlayResult<()> {
        let shared = ctx.shared()?;
        self.backup_shared_log(shared.as_ref()).await
    }

    async fn open_shared_stream(&self, ctx: &mut OpenContext) -> OverlayResult<OpenState> {
        let shared = self.shared_container.open_stream(self.stream_id).await?;
        shared
            .set_truncation_completion_event(Some(self.truncation_event.clone()))
            .await;
        self.logical.store(
            shared.stream_type() == LogStreamType::Logical,
            Ordering::Release,
        );
        let range = shared.query_record_range().await?;
        self.raise_shared_truncation(range.truncation, 0);
        ctx.shared = Some(Arc::new(MetricsLogStream::new(shared)));
        Ok(OpenState::OpenDedicatedContainer)
    }

    async fn open_dedicated_container(&self, ctx: &mut OpenContext) -> OverlayResult<OpenState> {
        let container = match &self.dedicated_path {
            Some(path) => self.factory.open_container_at(path).await?,
            None => {
                self.factory
                    .open_container(ContainerId::dedicated_for(self.stream_id))
                    .await?
            }
        };
        ctx.dedicated_container = Some(container);
        Ok(OpenState::OpenDedicatedStream)
    }

    async fn open_dedicated_stream(&self, ctx: &mut OpenContext) -> OverlayResult<OpenState> {
        let container = ctx.dedicated_container()?;
        let dedicated = Arc::new(MetricsLogStream::new(
            container.open_stream(self.stream_id).await?,
        ));
        ctx.dedicated = Some(dedicated.clone());
        let shared = ctx.shared()?;

        let dedicated_range = dedicated.query_record_range().await?;
        self.raise_shared_truncation(dedicated_range.truncation, 0);
        let (shared_truncation_asn, _) = self.shared_truncation_point();
        shared
            .truncate(shared_truncation_asn, shared_truncation_asn)
            .await?;

        let shared_range = shared.query_record_range().await?;
        ctx.shared_range = Some(shared_range);

        if !self.is_logical() || shared_range.is_empty() || dedicated_range.is_empty() {
            return Ok(OpenState::CopyFromSharedToDedicated);
        }

        // A newer dedicated copy means the shared records are stale.
        let first_shared = shared.query_record(shared_range.low, ReadMode::Exact).await?;
        let last_dedicated = dedicated
            .query_record(dedicated_range.high, ReadMode::Exact)
            .await?;
        if first_shared.version < last_dedicated.version {
            return Ok(OpenState::CopyFromSharedToDedicated);
        }
        Ok(OpenState::VerifyContiguity)
    }

    /// Fail with a structure fault when the shared log starts past the end
    /// of the dedicated log.
    async fn verify_contiguity(&self, ctx: &OpenContext) -> OverlayResult<OpenState> {
        let dedicated = ctx.dedicated()?;
        let container = ctx.dedicated_container()?;
        let first_shared = ctx.shared_range.map(|r| r.low).unwrap_or(ASN_MIN);
        let last_dedicated = dedicated.query_record_range().await?.high;

        let max_in_buffer = u64::from(self.config.fixed_metadata_size)
            .saturating_sub(container.record_overhead() + HEADER_SIZE as u64)
            + self.last_record_io_size(&dedicated, last_dedicated).await?;
        if first_shared > last_dedicated + max_in_buffer {
            return Err(self.gap_fault(first_shared, last_dedicated));
        }

        let record = dedicated
            .read(last_dedicated, ReadMode::Exact)
            .await
            .map_err(|err| OverlayError::StructureFault(format!("last dedicated record unreadable: {err}")))?;
        let header = LogicalLogHeader::parse(&record.metadata).map_err(|err| {
            OverlayError::StructureFault(format!("last dedicated record header invalid: {err}"))
        })?;
        if first_shared > last_dedicated + u64::from(header.data_size) {
            return Err(self.gap_fault(first_shared, last_dedicated));
        }
        Ok(OpenState::CopyFromSharedToDedicated)
    }

    async fn last_record_io_size(&self, dedicated: &MetricsLogStream, asn: Asn) -> OverlayResult<u64> {
        let info = dedicated.query_record(asn, ReadMode::Exact).await?;
        Ok(u64::from(info.io_size))
    }

    fn gap_fault(&self, first_shared: Asn, last_dedicated: Asn) -> OverlayError {
        error!(
            stream_id = %self.stream_id,
            first_shared,
            last_dedicated,
            "Shared log is not contiguous with dedicated log"
        );
        OverlayError::StructureFault(format!(
            "shared log starts at {first_shared}, past the end of dedicated record {last_dedicated}"
        ))
    }

    /// Move every record still in the shared log into the dedicated log.
    async fn copy_shared_to_dedicated(&self, ctx: &mut OpenContext) -> OverlayResult<OpenState> {
        let shared = ctx.shared()?;
        let dedicated = ctx.dedicated()?;
        let mut copied = 0usize;

        let mut range = shared.query_record_range().await?;
        while !range.is_empty() {
            let record = shared.read(range.low, ReadMode::Exact).await?;
            let write = WriteRecord {
                reservation: 0,
                asn: record.asn,
                version: record.version,
                metadata: record.metadata.clone(),
                data: record.data.clone(),
                force_flush: true,
            };
            match dedicated.write(write).await {
                Ok(()) => copied += 1,
                Err(LogStoreError::NameCollision { .. }) => {
                    debug!(stream_id = %self.stream_id, asn = record.asn, "Record already in dedicated log");
                }
                Err(err) => return Err(err.into()),
            }
            shared.truncate(record.asn, record.asn).await?;
            self.raise_shared_truncation(record.asn, record.version);
            range = shared.query_record_range().await?;
        }

        if copied > 0 {
            info!(stream_id = %self.stream_id, copied, "Copied shared log records to dedicated log");
        }
        ctx.shared_range = Some(range);
        Ok(if self.is_logical() {
            OpenState::RecoverTailAsn
        } else {
            OpenState::FinishOpen
        })
    }

    /// Find the logical tail and the last version from the dedicated log.
    async fn recover_tail(&self, ctx: &OpenContext) -> OverlayResult<OpenState> {
        let dedicated = ctx.dedicated()?;

        // Records after the highest version were superseded by a later
        // truncate-tail write that never completed in full.
        let mut highest: Option<(Asn, u64)> = None;
        for info in dedicated.query_records(ASN_MIN, ASN_MAX).await? {
            if !info.is_persisted() {
                continue;
            }
            match highest {
                Some((_, version)) if info.version <= version => {
                    warn!(
                        stream_id = %self.stream_id,
                        asn = info.asn,
                        version = info.version,
                        "Deleting superseded record"
                    );
                    dedicated.delete_record(info.asn, info.version).await?;
                }
                _ => highest = Some((info.asn, info.version)),
            }
        }

        let Some((mut asn, version)) = highest else {
            self.set_tail(ASN_MIN);
            self.last_version.store(0, Ordering::Release);
            return Ok(OpenState::FinishOpen);
        };
        self.last_version.store(version, Ordering::Release);

        loop {
            let record = dedicated.read(asn, ReadMode::Exact).await?;
            let header = LogicalLogHeader::parse(&record.metadata).map_err(|err| {
                OverlayError::StructureFault(format!("record {asn} header invalid: {err}"))
            })?;
            if let Some(end) = header.record_end_offset() {
                self.set_tail(end);
                *self
                    .recovered_header
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(header);
                break;
            }
            match dedicated.read(asn, ReadMode::Previous).await {
                Ok(previous) => asn = previous.asn,
                Err(err) if err.is_not_found() => {
                    self.set_tail(ASN_MIN);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(OpenState::FinishOpen)
    }

    fn finish_open(self: &Arc<Self>, ctx: &mut OpenContext) -> OverlayResult<OpenState> {
        let shared = ctx.shared()?;
        let dedicated = ctx.dedicated()?;
        let dedicated_container = ctx.dedicated_container()?;

        *self
            .allocation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(self.allocator.add_to_limit());

        let coalescer = self.is_logical().then(|| {
            let log: Arc<dyn LogStream> = dedicated.clone();
            Arc::new(CoalesceBuffer::new(
                self.stream_id,
                log,
                self.config.coalesce_buffer_size as usize,
                self.config.fixed_metadata_size,
            ))
        });

        self.install_logs(Some(Arc::new(StreamLogs {
            shared,
            dedicated,
            dedicated_container,
            coalescer: coalescer.clone(),
        })));

        let stream = Arc::downgrade(self);
        let event = self.truncation_event.clone();
        let backlog = self.backlog.clone();
        self.spawn_background(tokio::spawn(async move {
            loop {
                event.notified().await;
                if stream.strong_count() == 0 {
                    break;
                }
                backlog.should_unthrottle(false).await;
            }
        }));

        if let Some(coalescer) = coalescer {
            let stream = Arc::downgrade(self);
            let period = self.config.coalesce_flush_period();
            self.spawn_background(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let Some(stream) = stream.upgrade() else {
                        break;
                    };
                    let due = coalescer.pending_age().is_some_and(|age| age >= period)
                        || (!coalescer.is_idle() && stream.is_under_pressure_to_flush());
                    if due {
                        if let Err(err) = coalescer.flush().await {
                            debug!(stream_id = %stream.stream_id, error = %err, "Periodic flush failed");
                        }
                    }
                }
            }));
        }

        self.set_state(StreamState::Opened);
        Ok(OpenState::Completed)
    }
}
