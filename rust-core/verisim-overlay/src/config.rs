// SPDX-License-Identifier: PMPL-1.0-or-later
//! Overlay engine configuration.
//!
//! Every policy constant the engine uses lives here so that deployments can
//! tune throttling, coalescing and recovery behaviour from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, OverlayResult};
use crate::header::HEADER_SIZE;

/// Dedicated write-throttle threshold value that disables throttling.
pub const WRITE_THROTTLE_THRESHOLD_NO_LIMIT: u64 = u64::MAX;

/// Smallest dedicated write-throttle threshold accepted.
pub const WRITE_THROTTLE_THRESHOLD_MINIMUM: u64 = 64 * 1024;

/// Size of the fixed metadata block written ahead of each logical record.
pub const DEFAULT_FIXED_METADATA_SIZE: u32 = 4096;

/// Configuration for overlay streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Bytes of dedicated writes allowed in flight before new writes queue.
    pub dedicated_write_throttle_threshold: u64,
    /// Writes queue while the shared log has less free space than this.
    /// Zero disables shared-log throttling.
    pub shared_throttle_free_space: u64,
    /// Size of the metadata block carrying the logical-log header and the
    /// first bytes of record data.
    pub fixed_metadata_size: u32,
    /// Number of latency samples averaged before the running sums reset.
    pub latency_sample_count: u32,
    /// Attempts a logical-log read makes before giving up on a race with a
    /// concurrent coalesce flush.
    pub read_retry_limit: u32,
    /// Delay before a shared write that hit a full shared log is retried.
    pub log_full_retry_delay_ms: u64,
    /// Batch logical-log writes before they reach the dedicated log.
    pub coalescing_enabled: bool,
    /// Capacity of the coalesce buffer in bytes.
    pub coalesce_buffer_size: u32,
    /// Longest a coalesced write waits before a periodic flush.
    pub coalesce_flush_period_ms: u64,
    /// Start every stream in dedicated-only mode.
    pub write_only_to_dedicated: bool,
    /// Suffix appended to a stream's path to name its backup container.
    pub backup_suffix: String,
    /// Backup containers are sized in multiples of this many bytes.
    pub backup_size_rounding: u64,
    /// Headroom multiplier applied to the bytes a backup must hold.
    pub backup_growth_factor: f64,
    /// Capacity of the shared buffer allocator before any stream opens.
    pub allocator_base_limit: u64,
    /// Allocator capacity each open stream adds.
    pub allocator_stream_quota: u64,
    /// The allocator reports memory pressure below this percentage free.
    pub memory_pressure_percent: u8,
}

impl OverlayConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> OverlayResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> OverlayResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> OverlayResult<()> {
        if self.dedicated_write_throttle_threshold != WRITE_THROTTLE_THRESHOLD_NO_LIMIT
            && self.dedicated_write_throttle_threshold < WRITE_THROTTLE_THRESHOLD_MINIMUM
        {
            return Err(OverlayError::InvalidParameter(format!(
                "dedicated_write_throttle_threshold {} below minimum {}",
                self.dedicated_write_throttle_threshold, WRITE_THROTTLE_THRESHOLD_MINIMUM
            )));
        }
        if (self.fixed_metadata_size as usize) <= HEADER_SIZE {
            return Err(OverlayError::InvalidParameter(format!(
                "fixed_metadata_size {} must exceed header size {}",
                self.fixed_metadata_size, HEADER_SIZE
            )));
        }
        if self.latency_sample_count == 0 {
            return Err(OverlayError::InvalidParameter(
                "latency_sample_count must be positive".to_string(),
            ));
        }
        if self.read_retry_limit == 0 {
            return Err(OverlayError::InvalidParameter(
                "read_retry_limit must be positive".to_string(),
            ));
        }
        if self.coalesce_buffer_size < self.fixed_metadata_size {
            return Err(OverlayError::InvalidParameter(
                "coalesce_buffer_size smaller than fixed_metadata_size".to_string(),
            ));
        }
        if self.coalesce_flush_period_ms == 0 {
            return Err(OverlayError::InvalidParameter(
                "coalesce_flush_period_ms must be positive".to_string(),
            ));
        }
        if self.backup_size_rounding == 0 || self.backup_growth_factor < 1.0 {
            return Err(OverlayError::InvalidParameter(
                "backup sizing must round to a positive size and never shrink".to_string(),
            ));
        }
        if self.memory_pressure_percent > 100 {
            return Err(OverlayError::InvalidParameter(
                "memory_pressure_percent is a percentage".to_string(),
            ));
        }
        Ok(())
    }

    /// Shared log-full retry delay.
    pub fn log_full_retry_delay(&self) -> Duration {
        Duration::from_millis(self.log_full_retry_delay_ms)
    }

    /// Coalesce buffer flush period.
    pub fn coalesce_flush_period(&self) -> Duration {
        Duration::from_millis(self.coalesce_flush_period_ms)
    }

    /// Inline data capacity of the metadata block.
    pub fn inline_data_capacity(&self) -> u64 {
        u64::from(self.fixed_metadata_size) - HEADER_SIZE as u64
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            dedicated_write_throttle_threshold: 128 * 1024 * 1024,
            shared_throttle_free_space: 0,
            fixed_metadata_size: DEFAULT_FIXED_METADATA_SIZE,
            latency_sample_count: 100,
            read_retry_limit: 3,
            log_full_retry_delay_ms: 100,
            coalescing_enabled: true,
            coalesce_buffer_size: 1024 * 1024,
            coalesce_flush_period_ms: 25,
            write_only_to_dedicated: false,
            backup_suffix: ".Backup".to_string(),
            backup_size_rounding: 256 * 1024 * 1024,
            backup_growth_factor: 1.5,
            allocator_base_limit: 64 * 1024 * 1024,
            allocator_stream_quota: 16 * 1024 * 1024,
            memory_pressure_percent: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OverlayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.latency_sample_count, 100);
        assert_eq!(config.read_retry_limit, 3);
        assert_eq!(config.backup_suffix, ".Backup");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            OverlayConfig::from_json_str(r#"{ "coalescing_enabled": false, "read_retry_limit": 5 }"#)
                .unwrap();
        assert!(!config.coalescing_enabled);
        assert_eq!(config.read_retry_limit, 5);
        assert_eq!(config.fixed_metadata_size, DEFAULT_FIXED_METADATA_SIZE);
    }

    #[test]
    fn test_threshold_below_minimum_rejected() {
        let json = format!(
            r#"{{ "dedicated_write_throttle_threshold": {} }}"#,
            WRITE_THROTTLE_THRESHOLD_MINIMUM - 1
        );
        let err = OverlayConfig::from_json_str(&json).unwrap_err();
        assert!(matches!(err, OverlayError::InvalidParameter(_)));
    }

    #[test]
    fn test_no_limit_threshold_accepted() {
        let json = format!(
            r#"{{ "dedicated_write_throttle_threshold": {} }}"#,
            WRITE_THROTTLE_THRESHOLD_NO_LIMIT
        );
        let config = OverlayConfig::from_json_str(&json).unwrap();
        assert_eq!(
            config.dedicated_write_throttle_threshold,
            WRITE_THROTTLE_THRESHOLD_NO_LIMIT
        );
    }

    #[test]
    fn test_metadata_must_hold_header() {
        let config = OverlayConfig {
            fixed_metadata_size: HEADER_SIZE as u32,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "log_full_retry_delay_ms": 5 }}"#).unwrap();
        let config = OverlayConfig::load(file.path()).unwrap();
        assert_eq!(config.log_full_retry_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = OverlayConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, OverlayError::Config(_)));
    }
}
