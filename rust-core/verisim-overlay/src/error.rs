// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines every status the overlay engine can surface: caller input errors
// (malformed headers, out-of-sequence versions), structural faults detected
// while reconciling the shared and dedicated logs, sticky stream failures,
// and errors propagated from the underlying log store.

use thiserror::Error;
use verisim_logstore::{Asn, LogStoreError, Version};

/// Errors that can occur during overlay stream operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    /// An error reported by the shared or dedicated log.
    #[error("log store error: {0}")]
    Log(#[from] LogStoreError),

    /// No record satisfies the request.
    #[error("record not found at asn {0}")]
    NotFound(Asn),

    /// A logical-log write arrived with a version that does not follow the
    /// last accepted version.
    #[error("write out of sequence at asn {asn}: version {version}, expected {expected}")]
    OutOfSequence {
        /// ASN of the rejected write.
        asn: Asn,
        /// Version carried by the rejected write.
        version: Version,
        /// Version the stream expected next.
        expected: Version,
    },

    /// A request argument was outside the accepted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The embedded logical-log header failed validation.
    #[error("invalid logical log header: {0}")]
    InvalidHeader(String),

    /// The shared and dedicated logs disagree in a way that cannot be
    /// repaired automatically.
    #[error("log structure fault: {0}")]
    StructureFault(String),

    /// The stream is closing or closed.
    #[error("stream no longer exists")]
    ObjectNoLongerExists,

    /// The request is not valid for this kind of stream.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The caller's buffer cannot hold the result.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required.
        needed: u64,
        /// Bytes supplied.
        available: u64,
    },

    /// Memory or quota could not be obtained.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// A dedicated log write failed earlier; the stream no longer accepts
    /// writes.
    #[error("stream failed: {0}")]
    StreamFailed(Box<OverlayError>),

    /// The operation was abandoned because the stream is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// A configuration file could not be read.
    #[error("configuration error: {0}")]
    Config(String),
}

impl OverlayError {
    /// True for the "nothing there" family of errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Log(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// True when a log reported it is out of space.
    pub fn is_log_full(&self) -> bool {
        matches!(self, Self::Log(inner) if inner.is_log_full())
    }

    /// True for structural faults raised here or by a log.
    pub fn is_structure_fault(&self) -> bool {
        match self {
            Self::StructureFault(_) => true,
            Self::Log(inner) => inner.is_structure_fault(),
            _ => false,
        }
    }

    /// True when a log reported that the record already exists.
    pub fn is_name_collision(&self) -> bool {
        matches!(self, Self::Log(LogStoreError::NameCollision { .. }))
    }
}

impl From<serde_json::Error> for OverlayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for OverlayError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience type alias for overlay results.
pub type OverlayResult<T> = Result<T, OverlayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_out_of_sequence() {
        let error = OverlayError::OutOfSequence {
            asn: 100,
            version: 7,
            expected: 5,
        };
        let message = format!("{error}");
        assert!(message.contains("asn 100"));
        assert!(message.contains("version 7"));
        assert!(message.contains("expected 5"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(OverlayError::NotFound(3).is_not_found());
        assert!(OverlayError::Log(LogStoreError::ContainerNotFound("c".into())).is_not_found());
        assert!(!OverlayError::Cancelled.is_not_found());
    }

    #[test]
    fn test_structure_fault_classification() {
        assert!(OverlayError::StructureFault("gap".into()).is_structure_fault());
        assert!(
            OverlayError::Log(LogStoreError::StructureFault("bad".into())).is_structure_fault()
        );
    }

    #[test]
    fn test_log_full_classification() {
        let full = OverlayError::Log(LogStoreError::LogFull {
            requested: 10,
            available: 0,
        });
        assert!(full.is_log_full());
        assert!(!OverlayError::Cancelled.is_log_full());
    }

    #[test]
    fn test_stream_failed_wraps_cause() {
        let cause = OverlayError::Log(LogStoreError::BackendUnavailable("disk".into()));
        let failed = OverlayError::StreamFailed(Box::new(cause));
        assert!(failed.to_string().contains("disk"));
    }
}
