// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Close state machine
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Closing refuses new requests, lets in-flight writes finish, pushes any
// coalesced data to the dedicated log and then releases the stream's logs,
// background tasks and allocator quota. A closed stream may be opened again.

use std::sync::{Arc, PoisonError};

use tracing::{debug, info, warn};
use verisim_logstore::LogStream;

use crate::error::{OverlayError, OverlayResult};
use crate::stream::{OverlayStream, StreamLogs, StreamState};

/// States of the close state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    RefuseRequests,
    FlushCoalescer,
    WaitForRequests,
    StopBackgroundTasks,
    ReleaseLogs,
    CloseDedicatedContainer,
    ReleaseResources,
    Completed,
}

impl OverlayStream {
    /// Run the close state machine. Closing a stream that is not open is a
    /// no-op.
    pub(crate) async fn close(&self) -> OverlayResult<()> {
        match self.state() {
            StreamState::Opened => {}
            StreamState::Opening => {
                return Err(OverlayError::InvalidParameter(
                    "stream is still opening".to_string(),
                ))
            }
            StreamState::Created | StreamState::Closing | StreamState::Closed => return Ok(()),
        }
        self.set_state(StreamState::Closing);

        let logs: Option<Arc<StreamLogs>> = self.logs().ok();
        let mut first_error: Option<OverlayError> = None;
        let mut state = CloseState::RefuseRequests;

        while state != CloseState::Completed {
            debug!(stream_id = %self.stream_id, ?state, "Close state");
            state = match state {
                CloseState::RefuseRequests => {
                    self.request_refs().begin_close();
                    CloseState::FlushCoalescer
                }
                CloseState::FlushCoalescer => {
                    self.flush_coalescer(logs.as_deref(), &mut first_error).await;
                    CloseState::WaitForRequests
                }
                CloseState::WaitForRequests => {
                    self.request_refs().wait_drained().await;
                    // Writes that finished while draining may have buffered more.
                    self.flush_coalescer(logs.as_deref(), &mut first_error).await;
                    CloseState::StopBackgroundTasks
                }
                CloseState::StopBackgroundTasks => {
                    let handles = std::mem::take(
                        &mut *self.background.lock().unwrap_or_else(PoisonError::into_inner),
                    );
                    for handle in handles {
                        handle.abort();
                    }
                    CloseState::ReleaseLogs
                }
                CloseState::ReleaseLogs => {
                    if let Some(logs) = &logs {
                        logs.shared.set_truncation_completion_event(None).await;
                    }
                    if !self.dedicated_writes.is_empty() || !self.shared_writes.is_empty() {
                        warn!(
                            stream_id = %self.stream_id,
                            dedicated = self.dedicated_writes.len(),
                            shared = self.shared_writes.len(),
                            "Writes still outstanding at close"
                        );
                    }
                    self.install_logs(None);
                    CloseState::CloseDedicatedContainer
                }
                CloseState::CloseDedicatedContainer => {
                    if let Some(logs) = &logs {
                        if let Err(err) = logs.dedicated_container.close().await {
                            warn!(stream_id = %self.stream_id, error = %err, "Dedicated container close failed");
                            first_error.get_or_insert(err.into());
                        }
                    }
                    CloseState::ReleaseResources
                }
                CloseState::ReleaseResources => {
                    let allocation = self
                        .allocation
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(allocation) = allocation {
                        self.allocator.remove_from_limit(allocation).await;
                    }
                    self.thresholds.cancel_all();
                    CloseState::Completed
                }
                CloseState::Completed => CloseState::Completed,
            };
        }

        self.set_state(StreamState::Closed);
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(stream_id = %self.stream_id, "Overlay stream closed");
                Ok(())
            }
        }
    }

    async fn flush_coalescer(&self, logs: Option<&StreamLogs>, first_error: &mut Option<OverlayError>) {
        let Some(coalescer) = logs.and_then(|logs| logs.coalescer.clone()) else {
            return;
        };
        if let Err(err) = coalescer.flush().await {
            warn!(stream_id = %self.stream_id, error = %err, "Coalesce flush at close failed");
            first_error.get_or_insert(err);
        }
    }
}
