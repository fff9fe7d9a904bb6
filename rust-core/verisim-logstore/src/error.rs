// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Log store error types for VeriSimDB.
//
// A single error enum covers every failure a log container or log stream can
// report: missing records, streams and containers, ASN collisions, exhausted
// space, structural corruption and closed handles. Errors are `Clone` so that
// callers may latch a failure and report it again later.

use thiserror::Error;

use crate::types::{Asn, Version};

/// Errors that can occur when interacting with a log container or stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogStoreError {
    /// No record satisfies the query.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The log stream does not exist in the container.
    #[error("log stream not found: {0}")]
    StreamNotFound(String),

    /// The log container does not exist.
    #[error("log container not found: {0}")]
    ContainerNotFound(String),

    /// An object with the same identity already exists.
    #[error("record already exists at asn {asn} version {version}")]
    NameCollision {
        /// ASN of the existing record.
        asn: Asn,
        /// Version of the existing record.
        version: Version,
    },

    /// A stream or container with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The container does not have room for the request.
    #[error("log full: requested {requested} bytes, {available} available")]
    LogFull {
        /// Bytes the request needed.
        requested: u64,
        /// Bytes that were free.
        available: u64,
    },

    /// The record exceeds the container's maximum record size.
    #[error("record too large: {size} bytes (max: {max})")]
    RecordTooLarge {
        /// Actual record size in bytes.
        size: u64,
        /// Maximum allowed record size in bytes.
        max: u64,
    },

    /// On-disk structures are inconsistent.
    #[error("log structure fault: {0}")]
    StructureFault(String),

    /// A record failed integrity checks.
    #[error("corrupted record: {0}")]
    CorruptedData(String),

    /// An argument was outside the accepted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The stream or container has been closed.
    #[error("log handle closed: {0}")]
    Closed(String),

    /// The backing device is unavailable.
    #[error("log backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl LogStoreError {
    /// True for the "nothing there" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::StreamNotFound(_) | Self::ContainerNotFound(_)
        )
    }

    /// True when the container ran out of space.
    pub fn is_log_full(&self) -> bool {
        matches!(self, Self::LogFull { .. })
    }

    /// True when on-disk structures are inconsistent.
    pub fn is_structure_fault(&self) -> bool {
        matches!(self, Self::StructureFault(_))
    }
}

/// Convenience type alias for log store results.
pub type LogStoreResult<T> = Result<T, LogStoreError>;
