//! Common types and error definitions for flexkv
//!
//! This module contains the configuration, shared constants, and the error
//! taxonomy used throughout the system.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of a hardware cache line; one hash bucket occupies exactly one line.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Number of 16-byte entries in a hash bucket (cache line / entry size).
pub const ENTRIES_PER_BUCKET: u64 = 4;

/// Size of one bit-packed hash entry on disk and in memory.
pub const HASH_ENTRY_SIZE: u64 = 16;

/// Pages at the front of the index file reserved for metadata: the header
/// triple and the serialized directory.
pub const INDEX_META_PAGES: u64 = 256;

/// Default page size. Mappings require offsets aligned to the OS page, so
/// configured page sizes below 4 KiB are rejected.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Default number of pages in the circular log window.
pub const DEFAULT_LOG_WINDOW_PAGES: u64 = 1024;

/// Default page budget of the read-only cache used for cold log reads.
pub const DEFAULT_READ_CACHE_PAGES: u64 = 2048;

/// Default number of in-memory slots in the index page pool.
pub const DEFAULT_INDEX_POOL_SLOTS: usize = 1024;

/// Error type for flexkv operations
#[derive(Error, Debug)]
pub enum KvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No mapping for the fingerprint, or a record chain walked to its end
    /// without a key match
    #[error("key not found")]
    NotFound,

    /// `put` on a fingerprint already present and not deleted; carries the
    /// address the index currently holds
    #[error("fingerprint already mapped to address {address}")]
    Exists { address: u64 },

    /// The file's stored page size disagrees with the running configuration
    #[error("stored page size {stored} does not match configured page size {configured}")]
    LoadMismatch { stored: u64, configured: u64 },

    /// Record larger than the whole log window
    #[error("record of {size} bytes exceeds the log window of {window} bytes")]
    RecordTooLarge { size: u64, window: u64 },

    /// Scratch or directory allocation failed
    #[error("allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Result type alias for flexkv operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Configuration for a flexkv store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Page size in bytes; power of two, at least 4 KiB
    pub page_size: u64,
    /// Initial number of directory entries; power of two, at least 2
    pub initial_directory_size: u64,
    /// Number of pages in the circular log window
    pub log_window_pages: u64,
    /// Page budget of the read-only cache for cold log reads
    pub read_cache_pages: u64,
    /// Number of in-memory slots in the index page pool
    pub index_pool_slots: usize,
    /// Upper bound on background-flush attempts per flusher iteration
    pub flush_batch_limit: u32,
    /// Timeout of one background-flush condition wait, in microseconds
    pub flusher_wait_micros: u64,
}

impl Config {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 4096 {
            return Err(KvError::InvalidConfig {
                message: "page size must be at least 4 KiB".to_string(),
            });
        }
        if !self.page_size.is_power_of_two() {
            return Err(KvError::InvalidConfig {
                message: "page size must be a power of 2".to_string(),
            });
        }
        if self.initial_directory_size < 2 || !self.initial_directory_size.is_power_of_two() {
            return Err(KvError::InvalidConfig {
                message: "initial directory size must be a power of 2 and at least 2".to_string(),
            });
        }
        if self.log_window_pages < 2 {
            return Err(KvError::InvalidConfig {
                message: "log window must span at least 2 pages".to_string(),
            });
        }
        if self.read_cache_pages == 0 {
            return Err(KvError::InvalidConfig {
                message: "read cache must hold at least 1 page".to_string(),
            });
        }
        if self.index_pool_slots < 2 {
            return Err(KvError::InvalidConfig {
                message: "index page pool must hold at least 2 slots".to_string(),
            });
        }
        if self.flush_batch_limit == 0 {
            return Err(KvError::InvalidConfig {
                message: "flush batch limit must be at least 1".to_string(),
            });
        }
        if self.log_window_pages > self.read_cache_pages {
            log::warn!(
                "log window ({} pages) exceeds the read cache ({} pages); cold reads of large records will thrash",
                self.log_window_pages,
                self.read_cache_pages
            );
        }
        Ok(())
    }

    /// Number of buckets in one hash page.
    pub fn buckets_per_page(&self) -> u64 {
        self.page_size / CACHE_LINE_SIZE
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_directory_size: 64,
            log_window_pages: DEFAULT_LOG_WINDOW_PAGES,
            read_cache_pages: DEFAULT_READ_CACHE_PAGES,
            index_pool_slots: DEFAULT_INDEX_POOL_SLOTS,
            flush_batch_limit: 10,
            flusher_wait_micros: 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_small_page_size() {
        let config = Config {
            page_size: 512,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KvError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_non_power_of_two_page_size() {
        let config = Config {
            page_size: 5000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_directory() {
        let config = Config {
            initial_directory_size: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buckets_per_page() {
        let config = Config::default();
        assert_eq!(config.buckets_per_page(), 64);
    }
}
