//! Bucket index tuning knobs.
//!
//! These mirror the node configuration entries that control how bucket
//! indexes are built: small bucket files carry an individual-key index,
//! large ones a page-based range index.

/// Configuration for bucket index construction.
#[derive(Debug, Clone)]
pub struct BucketIndexConfig {
    /// File size cutoff in megabytes below which a bucket gets an
    /// individual-key index. At or above the cutoff a page-based range
    /// index is built instead.
    pub index_cutoff_mb: u64,
    /// Page size exponent for the range index; pages are `1 << exponent`
    /// bytes. An exponent of 0 disables paging (every key gets an exact
    /// offset, as in the individual-key index).
    pub page_size_exponent: u32,
}

impl BucketIndexConfig {
    /// Default cutoff: 20 MB.
    pub const DEFAULT_INDEX_CUTOFF_MB: u64 = 20;
    /// Default page size exponent: 14 (16 KiB pages).
    pub const DEFAULT_PAGE_SIZE_EXPONENT: u32 = 14;

    /// The cutoff in bytes.
    pub fn index_cutoff_bytes(&self) -> u64 {
        self.index_cutoff_mb * 1024 * 1024
    }

    /// The page size in bytes, or 0 if paging is disabled.
    pub fn page_size_bytes(&self) -> u64 {
        if self.page_size_exponent == 0 {
            0
        } else {
            1u64 << self.page_size_exponent
        }
    }
}

impl Default for BucketIndexConfig {
    fn default() -> Self {
        Self {
            index_cutoff_mb: Self::DEFAULT_INDEX_CUTOFF_MB,
            page_size_exponent: Self::DEFAULT_PAGE_SIZE_EXPONENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BucketIndexConfig::default();
        assert_eq!(config.index_cutoff_bytes(), 20 * 1024 * 1024);
        assert_eq!(config.page_size_bytes(), 16384);
    }

    #[test]
    fn test_zero_exponent_disables_paging() {
        let config = BucketIndexConfig {
            index_cutoff_mb: 0,
            page_size_exponent: 0,
        };
        assert_eq!(config.page_size_bytes(), 0);
    }
}
