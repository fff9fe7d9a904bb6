// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core value types shared by every log store implementation.
//
// Records are addressed by an ASN (append sequence number, the logical byte
// offset of the record within its stream) and carry a monotonically
// increasing version. Buffers are reference counted so that one logical
// write can be handed to several physical writes without copying.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append sequence number: the logical offset of a record in its stream.
pub type Asn = u64;

/// Record version. Higher versions supersede lower ones at the same ASN.
pub type Version = u64;

/// Reference-counted, immutable record buffer.
pub type SharedBuffer = Arc<[u8]>;

/// The "no ASN" value.
pub const ASN_NULL: Asn = 0;

/// The lowest ASN a record may carry.
pub const ASN_MIN: Asn = 1;

/// The highest representable ASN.
pub const ASN_MAX: Asn = u64::MAX;

/// Version value meaning "any version".
pub const VERSION_MAX: Version = u64::MAX;

/// Create an empty shared buffer.
pub fn empty_buffer() -> SharedBuffer {
    Arc::from(Vec::new())
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of a log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Generate a fresh random stream id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuild a stream id from its raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a log container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub Uuid);

impl ContainerId {
    /// Generate a fresh random container id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// The dedicated container of a stream shares the stream's id.
    pub fn dedicated_for(stream_id: StreamId) -> Self {
        Self(stream_id.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind of data a stream holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStreamType {
    /// Plain record stream addressed by ASN only.
    Plain,
    /// Contiguous byte-offset stream with embedded logical-log headers.
    Logical,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// How a record lookup relates the requested ASN to the record returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadMode {
    /// The record at exactly this ASN.
    Exact,
    /// The record after an existing record at this ASN.
    Next,
    /// The record before an existing record at this ASN.
    Previous,
    /// The highest record at or below this ASN.
    Containing,
    /// The lowest record strictly above this ASN, whether or not a record
    /// exists at the ASN itself.
    NextFromSpecificAsn,
    /// The highest record strictly below this ASN, whether or not a record
    /// exists at the ASN itself.
    PreviousFromSpecificAsn,
}

/// Durability state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordDisposition {
    /// Durable and readable.
    Persisted,
    /// Write issued but not yet durable.
    Pending,
    /// No such record.
    None,
}

/// Metadata describing one record without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    /// Record ASN.
    pub asn: Asn,
    /// Record version.
    pub version: Version,
    /// Durability state.
    pub disposition: RecordDisposition,
    /// Size of the metadata buffer.
    pub metadata_size: u32,
    /// Size of the data (io) buffer.
    pub io_size: u32,
}

impl RecordInfo {
    /// A "no record" answer for `asn`.
    pub fn none(asn: Asn) -> Self {
        Self {
            asn,
            version: 0,
            disposition: RecordDisposition::None,
            metadata_size: 0,
            io_size: 0,
        }
    }

    /// True when the record is durable.
    pub fn is_persisted(&self) -> bool {
        self.disposition == RecordDisposition::Persisted
    }

    /// True when no record was found.
    pub fn is_none(&self) -> bool {
        self.disposition == RecordDisposition::None
    }

    /// Total physical size of the record.
    pub fn total_size(&self) -> u64 {
        u64::from(self.metadata_size) + u64::from(self.io_size)
    }
}

/// The ASN range a stream currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordRange {
    /// Lowest ASN present.
    pub low: Asn,
    /// Highest ASN present.
    pub high: Asn,
    /// ASN at or below which the stream has been truncated.
    pub truncation: Asn,
}

impl RecordRange {
    /// A stream is empty when its range collapses onto the truncation point.
    pub fn is_empty(&self) -> bool {
        self.low == self.high && self.high <= self.truncation
    }
}

/// A record read back from a stream.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// ASN the record was found at.
    pub asn: Asn,
    /// Record version.
    pub version: Version,
    /// Metadata buffer.
    pub metadata: SharedBuffer,
    /// Data (io) buffer.
    pub data: SharedBuffer,
}

impl LogRecord {
    /// Total physical size of the record.
    pub fn total_size(&self) -> u64 {
        (self.metadata.len() + self.data.len()) as u64
    }
}

/// A reserved write request.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// Bytes of previously reserved space this write consumes.
    pub reservation: u64,
    /// Target ASN.
    pub asn: Asn,
    /// Record version.
    pub version: Version,
    /// Metadata buffer.
    pub metadata: SharedBuffer,
    /// Data (io) buffer.
    pub data: SharedBuffer,
    /// Request that this write (and anything buffered before it) be made
    /// durable immediately.
    pub force_flush: bool,
}

impl WriteRecord {
    /// Build a write with no reservation and no forced flush.
    pub fn new(asn: Asn, version: Version, metadata: SharedBuffer, data: SharedBuffer) -> Self {
        Self {
            reservation: 0,
            asn,
            version,
            metadata,
            data,
            force_flush: false,
        }
    }

    /// Total physical size of the record.
    pub fn total_size(&self) -> u64 {
        (self.metadata.len() + self.data.len()) as u64
    }
}

/// Space accounting for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceInfo {
    /// Total capacity in bytes.
    pub total: u64,
    /// Bytes neither written nor reserved.
    pub free: u64,
}
