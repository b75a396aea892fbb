//! # Index Configuration
//!
//! Tunables for the GTID index, centralized so interdependent values stay
//! together. Neither knob affects correctness; they trade index size against
//! the length of the sequential binlog scan a reader performs after seeking
//! to the position the index returned.
//!
//! ## Knobs
//!
//! - `page_size`: size of every page in one index file, recorded once in the
//!   file header. Smaller pages mean a deeper tree; larger pages mean more
//!   wasted tail space per node. Must fit the fixed page overhead
//!   (file header + page header + checksum) with room to spare, hence the
//!   64-byte floor.
//!
//! - `span_min`: minimum number of binlog bytes between two indexed records.
//!   The index is deliberately sparse: an offset less than `span_min` past
//!   the previously indexed one is absorbed into the pending state instead of
//!   producing a record, and the reader scans the binlog forward from the
//!   nearest indexed point.

use eyre::{ensure, Result};

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MIN_PAGE_SIZE: u32 = 64;
pub const MAX_PAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Default binlog-byte span between indexed records (sparse index).
pub const DEFAULT_SPAN_MIN: u64 = 65536;

#[derive(Debug, Clone, Copy)]
pub struct GtidIndexConfig {
    pub page_size: u32,
    pub span_min: u64,
}

impl Default for GtidIndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            span_min: DEFAULT_SPAN_MIN,
        }
    }
}

impl GtidIndexConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "index page size {} out of range [{}, {}]",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(GtidIndexConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_and_huge_pages() {
        let mut config = GtidIndexConfig::default();
        config.page_size = 32;
        assert!(config.validate().is_err());
        config.page_size = MAX_PAGE_SIZE + 1;
        assert!(config.validate().is_err());
        config.page_size = MIN_PAGE_SIZE;
        assert!(config.validate().is_ok());
    }
}
