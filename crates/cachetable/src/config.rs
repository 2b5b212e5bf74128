//! Cachetable configuration
//!
//! Loaded from JSON (or built in code) with serde; every field has a
//! default so partial files are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning knobs consumed when a cachetable is created
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CachetableConfig {
    /// Memory budget for resident pairs, in bytes
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,

    /// Background writer / prefetch threads
    #[serde(default = "default_writer_threads")]
    pub writer_threads: usize,

    /// Clients sleep on in-flight evictions above `size_limit * pct / 100`
    #[serde(default = "default_high_watermark_pct")]
    pub high_watermark_pct: u32,

    /// Background evictor period (0 disables the thread)
    #[serde(default = "default_eviction_period_ms")]
    pub eviction_period_ms: u64,

    /// Periodic checkpoint period (0 disables the thread)
    #[serde(default)]
    pub checkpoint_period_ms: u64,

    /// Cleaner period (0 disables the thread)
    #[serde(default)]
    pub cleaner_period_ms: u64,

    /// Pairs handed to the cleaner callback per wake-up
    #[serde(default = "default_cleaner_iterations")]
    pub cleaner_iterations: usize,
}

fn default_size_limit() -> usize {
    128 * 1024 * 1024
}

fn default_writer_threads() -> usize {
    4
}

fn default_high_watermark_pct() -> u32 {
    125
}

fn default_eviction_period_ms() -> u64 {
    1000
}

fn default_cleaner_iterations() -> usize {
    1
}

impl Default for CachetableConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            writer_threads: default_writer_threads(),
            high_watermark_pct: default_high_watermark_pct(),
            eviction_period_ms: default_eviction_period_ms(),
            checkpoint_period_ms: 0,
            cleaner_period_ms: 0,
            cleaner_iterations: default_cleaner_iterations(),
        }
    }
}

impl CachetableConfig {
    /// Default configuration with the given memory budget
    pub fn with_size_limit(size_limit: usize) -> Self {
        Self {
            size_limit,
            ..Self::default()
        }
    }

    /// Reject configurations the cachetable cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.size_limit == 0 {
            return Err(Error::Config("size_limit must be positive".to_string()));
        }
        if self.writer_threads == 0 {
            return Err(Error::Config(
                "writer_threads must be at least 1".to_string(),
            ));
        }
        if self.high_watermark_pct < 100 {
            return Err(Error::Config(format!(
                "high_watermark_pct must be >= 100, got {}",
                self.high_watermark_pct
            )));
        }
        if self.cleaner_iterations == 0 {
            return Err(Error::Config(
                "cleaner_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resident size above which clients wait for in-flight evictions
    pub fn high_watermark(&self) -> usize {
        self.size_limit
            .saturating_mul(self.high_watermark_pct as usize)
            / 100
    }

    pub(crate) fn period(ms: u64) -> Option<Duration> {
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CachetableConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.high_watermark(), 160 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let config = CachetableConfig::with_size_limit(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_low_watermark() {
        let config = CachetableConfig {
            high_watermark_pct: 90,
            ..CachetableConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CachetableConfig =
            serde_json::from_str(r#"{"size_limit": 4096, "checkpoint_period_ms": 250}"#).unwrap();

        assert_eq!(config.size_limit, 4096);
        assert_eq!(config.checkpoint_period_ms, 250);
        assert_eq!(config.writer_threads, 4);
        assert_eq!(config.cleaner_period_ms, 0);
    }

    #[test]
    fn test_period_zero_disables() {
        assert_eq!(CachetableConfig::period(0), None);
        assert_eq!(
            CachetableConfig::period(5),
            Some(Duration::from_millis(5))
        );
    }
}
