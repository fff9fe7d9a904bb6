// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Overlay Log - Logical log record header
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every record of a logical-log stream starts with a fixed-size metadata
// block. The block opens with the header below, followed by the first bytes
// of record data; any remaining data lives in the record's io buffer.
//
// On-disk header format (all integers little-endian):
//   [8 bytes:  signature]
//   [16 bytes: stream id]
//   [8 bytes:  stream offset]            -- must equal the record ASN
//   [8 bytes:  highest operation id]     -- must equal the record version
//   [4 bytes:  data size]                -- logical bytes in the record
//   [4 bytes:  record marker offset + 1] -- 0 when no logical record ends here
//   [4 bytes:  flags]                    -- bit 0: end of record
//   [4 bytes:  reserved, zero]
//   [8 bytes:  data crc64]               -- CRC64 of the logical bytes
//   [8 bytes:  header crc64]             -- CRC64 of the preceding 64 bytes

use std::sync::Arc;

use crc64fast_nvme::Digest;
use serde::{Deserialize, Serialize};
use verisim_logstore::{Asn, SharedBuffer, StreamId, Version};

use crate::error::{OverlayError, OverlayResult};

/// Magic number opening every logical-log header.
pub const LOGICAL_LOG_SIGNATURE: u64 = 0x5653_4C47_4C4F_4731;

/// Encoded size of [`LogicalLogHeader`].
pub const HEADER_SIZE: usize = 72;

/// Header flag: this write completes a logical record.
pub const FLAG_END_OF_RECORD: u32 = 0x1;

/// Bytes covered by the header CRC.
const HEADER_CRC_SPAN: usize = 64;

/// Round `value` up to the next multiple of 4 KiB.
pub fn round_up_4k(value: u64) -> u64 {
    value.div_ceil(4096) * 4096
}

/// CRC64 of `bytes`.
pub fn crc64(bytes: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(bytes);
    digest.sum64()
}

// ---------------------------------------------------------------------------
// LogicalLogHeader
// ---------------------------------------------------------------------------

/// The header embedded at the start of every logical-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalLogHeader {
    /// Always [`LOGICAL_LOG_SIGNATURE`].
    pub signature: u64,
    /// Stream the record belongs to.
    pub stream_id: StreamId,
    /// Logical offset of the first data byte; equals the record ASN.
    pub stream_offset: u64,
    /// Highest operation id covered; equals the record version.
    pub highest_operation_id: u64,
    /// Logical bytes carried by the record.
    pub data_size: u32,
    /// One past the offset at which the last complete logical record ends,
    /// or zero when no logical record ends inside this one.
    pub record_marker_offset_plus_one: u32,
    /// Header flags.
    pub flags: u32,
    /// CRC64 of the logical bytes.
    pub data_crc: u64,
    /// CRC64 of the encoded header up to this field.
    pub header_crc: u64,
}

impl LogicalLogHeader {
    /// Build a header for `payload` written at `asn` with `version`.
    pub fn new(stream_id: StreamId, asn: Asn, version: Version, payload: &[u8], end_of_record: bool) -> Self {
        Self {
            signature: LOGICAL_LOG_SIGNATURE,
            stream_id,
            stream_offset: asn,
            highest_operation_id: version,
            data_size: payload.len() as u32,
            record_marker_offset_plus_one: 0,
            flags: if end_of_record { FLAG_END_OF_RECORD } else { 0 },
            data_crc: crc64(payload),
            header_crc: 0,
        }
    }

    /// True when the writer flagged this record as ending a logical record.
    pub fn is_end_of_record(&self) -> bool {
        self.flags & FLAG_END_OF_RECORD != 0
    }

    /// Mark a logical record as ending `end` bytes into this record.
    pub fn mark_record_end(&mut self, end: u32) {
        self.record_marker_offset_plus_one = end + 1;
    }

    /// Stream offset just past the last logical record ending in this
    /// record, if one does.
    pub fn record_end_offset(&self) -> Option<Asn> {
        match self.record_marker_offset_plus_one {
            0 => None,
            marker => Some(self.stream_offset + u64::from(marker) - 1),
        }
    }

    /// Encode the header, computing a fresh header CRC.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.signature.to_le_bytes());
        buf[8..24].copy_from_slice(self.stream_id.as_bytes());
        buf[24..32].copy_from_slice(&self.stream_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.highest_operation_id.to_le_bytes());
        buf[40..44].copy_from_slice(&self.data_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.record_marker_offset_plus_one.to_le_bytes());
        buf[48..52].copy_from_slice(&self.flags.to_le_bytes());
        buf[56..64].copy_from_slice(&self.data_crc.to_le_bytes());
        let header_crc = crc64(&buf[..HEADER_CRC_SPAN]);
        buf[64..72].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    /// Decode and check the header at the start of `metadata`.
    pub fn parse(metadata: &[u8]) -> OverlayResult<Self> {
        if metadata.len() < HEADER_SIZE {
            return Err(OverlayError::InvalidHeader(format!(
                "metadata of {} bytes cannot hold a header",
                metadata.len()
            )));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&metadata[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&metadata[at..at + 4]);
            u32::from_le_bytes(raw)
        };

        let signature = u64_at(0);
        if signature != LOGICAL_LOG_SIGNATURE {
            return Err(OverlayError::InvalidHeader(format!(
                "bad signature {signature:#018x}"
            )));
        }

        let stored_crc = u64_at(64);
        let computed_crc = crc64(&metadata[..HEADER_CRC_SPAN]);
        if stored_crc != computed_crc {
            return Err(OverlayError::InvalidHeader(format!(
                "header crc mismatch: stored {stored_crc:#018x}, computed {computed_crc:#018x}"
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&metadata[8..24]);

        Ok(Self {
            signature,
            stream_id: StreamId::from_bytes(id),
            stream_offset: u64_at(24),
            highest_operation_id: u64_at(32),
            data_size: u32_at(40),
            record_marker_offset_plus_one: u32_at(44),
            flags: u32_at(48),
            data_crc: u64_at(56),
            header_crc: stored_crc,
        })
    }

    /// Extract the logical bytes described by this header.
    pub fn payload(&self, metadata: &[u8], data: &[u8]) -> OverlayResult<Vec<u8>> {
        let wanted = self.data_size as usize;
        let inline = &metadata[HEADER_SIZE.min(metadata.len())..];
        let from_inline = wanted.min(inline.len());
        let from_data = wanted - from_inline;
        if from_data > data.len() {
            return Err(OverlayError::InvalidHeader(format!(
                "data size {} exceeds record buffers ({} inline, {} io)",
                wanted,
                inline.len(),
                data.len()
            )));
        }
        let mut payload = Vec::with_capacity(wanted);
        payload.extend_from_slice(&inline[..from_inline]);
        payload.extend_from_slice(&data[..from_data]);
        Ok(payload)
    }

    /// Check the data CRC against the record buffers.
    pub fn verify_data(&self, metadata: &[u8], data: &[u8]) -> OverlayResult<()> {
        let payload = self.payload(metadata, data)?;
        let computed = crc64(&payload);
        if computed != self.data_crc {
            return Err(OverlayError::InvalidHeader(format!(
                "data crc mismatch at offset {}: stored {:#018x}, computed {computed:#018x}",
                self.stream_offset, self.data_crc
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record buffers
// ---------------------------------------------------------------------------

/// Lay `payload` out as a logical-log record: a metadata block of
/// `fixed_metadata_size` bytes holding the header and the first bytes of
/// data, plus an io buffer holding the rest.
pub fn build_record(
    header: &LogicalLogHeader,
    payload: &[u8],
    fixed_metadata_size: u32,
) -> (SharedBuffer, SharedBuffer) {
    let block = fixed_metadata_size as usize;
    let inline_capacity = block.saturating_sub(HEADER_SIZE);
    let inline = payload.len().min(inline_capacity);

    let mut metadata = vec![0u8; block.max(HEADER_SIZE)];
    metadata[..HEADER_SIZE].copy_from_slice(&header.encode());
    metadata[HEADER_SIZE..HEADER_SIZE + inline].copy_from_slice(&payload[..inline]);

    (Arc::from(metadata), Arc::from(payload[inline..].to_vec()))
}

/// Build a complete logical-log record for `payload`.
pub fn encode_record(
    stream_id: StreamId,
    asn: Asn,
    version: Version,
    payload: &[u8],
    end_of_record: bool,
    fixed_metadata_size: u32,
) -> (SharedBuffer, SharedBuffer) {
    let header = LogicalLogHeader::new(stream_id, asn, version, payload, end_of_record);
    build_record(&header, payload, fixed_metadata_size)
}

/// Copy `metadata` with its header replaced by `header`.
pub fn rewrite_header(metadata: &[u8], header: &LogicalLogHeader) -> SharedBuffer {
    let mut copy = metadata.to_vec();
    if copy.len() >= HEADER_SIZE {
        copy[..HEADER_SIZE].copy_from_slice(&header.encode());
    }
    Arc::from(copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(payload: &[u8]) -> LogicalLogHeader {
        LogicalLogHeader::new(StreamId::new_v4(), 100, 5, payload, true)
    }

    #[test]
    fn test_encode_then_parse() {
        let payload = b"hello logical log";
        let header = header_for(payload);
        let parsed = LogicalLogHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed.stream_offset, 100);
        assert_eq!(parsed.highest_operation_id, 5);
        assert_eq!(parsed.data_size, payload.len() as u32);
        assert!(parsed.is_end_of_record());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut bytes = header_for(b"x").encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            LogicalLogHeader::parse(&bytes),
            Err(OverlayError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_corrupted_field_fails_header_crc() {
        let mut bytes = header_for(b"abc").encode();
        bytes[30] ^= 0x01;
        let err = LogicalLogHeader::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("crc"));
    }

    #[test]
    fn test_short_metadata_rejected() {
        assert!(LogicalLogHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_payload_spans_inline_and_io() {
        let payload: Vec<u8> = (0..200u8).collect();
        let header = header_for(&payload);
        let (metadata, data) = build_record(&header, &payload, 128);
        assert_eq!(metadata.len(), 128);
        assert_eq!(data.len(), 200 - (128 - HEADER_SIZE));

        let parsed = LogicalLogHeader::parse(&metadata).unwrap();
        assert_eq!(parsed.payload(&metadata, &data).unwrap(), payload);
        parsed.verify_data(&metadata, &data).unwrap();
    }

    #[test]
    fn test_data_crc_detects_corruption() {
        let payload = vec![7u8; 64];
        let (metadata, data) = encode_record(StreamId::new_v4(), 1, 1, &payload, false, 4096);
        let mut damaged = metadata.to_vec();
        damaged[HEADER_SIZE + 3] = 0;
        let parsed = LogicalLogHeader::parse(&damaged).unwrap();
        assert!(parsed.verify_data(&damaged, &data).is_err());
    }

    #[test]
    fn test_rewrite_header_updates_marker() {
        let payload = vec![1u8; 32];
        let (metadata, _) = encode_record(StreamId::new_v4(), 1, 1, &payload, true, 256);
        let mut header = LogicalLogHeader::parse(&metadata).unwrap();
        header.record_marker_offset_plus_one = 33;
        let rewritten = rewrite_header(&metadata, &header);
        let parsed = LogicalLogHeader::parse(&rewritten).unwrap();
        assert_eq!(parsed.record_marker_offset_plus_one, 33);
    }

    #[test]
    fn test_record_end_offset_follows_marker() {
        let mut header = LogicalLogHeader::new(StreamId::new_v4(), 100, 5, &[0u8; 40], true);
        assert_eq!(header.record_end_offset(), None);
        header.mark_record_end(40);
        assert_eq!(header.record_marker_offset_plus_one, 41);
        assert_eq!(header.record_end_offset(), Some(140));
    }

    #[test]
    fn test_round_up_4k() {
        assert_eq!(round_up_4k(0), 0);
        assert_eq!(round_up_4k(1), 4096);
        assert_eq!(round_up_4k(4096), 4096);
        assert_eq!(round_up_4k(4097), 8192);
    }
}
