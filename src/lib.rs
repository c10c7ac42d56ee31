//! # flexkv: an embeddable persistent key-value store
//!
//! `flexkv` pairs two storage engines behind a thin coordinator:
//!
//! - **Extendible hash index**: fingerprints map to log addresses through
//!   in-file hash pages with per-page overflow buckets, lazy page splits,
//!   and directory doubling, cached in a fixed pool of memory mappings.
//! - **Append-only record log**: records are written into a circular
//!   in-memory window over the log file; a background flusher drains whole
//!   pages behind the writer, and cold records are read back through a
//!   bounded read-only mapping cache.
//!
//! Operations are serial on a single writer. Durability is
//! checkpoint-based: `checkpoint` (and `close`) drain the flush queue and
//! rewrite both files' metadata so the store reopens to a consistent
//! prefix.
//!
//! ## Example
//!
//! ```rust,ignore
//! use flexkv::{Config, Kv};
//!
//! fn main() -> flexkv::Result<()> {
//!     let mut kv = Kv::create("./store", Config::default())?;
//!     kv.put(&b"hello".to_vec(), &b"world".to_vec())?;
//!     let value: Option<Vec<u8>> = kv.get(&b"hello".to_vec())?;
//!     assert_eq!(value, Some(b"world".to_vec()));
//!     kv.close()
//! }
//! ```

pub mod catalog;
pub mod common;
pub mod file;
pub mod index;
pub mod key_value;
pub mod kv;
pub mod log;
pub mod read_cache;
pub mod record;


// Re-export commonly used types
pub use catalog::Catalog;
pub use common::{Config, KvError, Result};
pub use file::{MappedRegion, PageFile, ReadRegion};
pub use index::HashIndex;
pub use key_value::{LogKey, LogValue};
pub use kv::{Kv, default_fingerprint};
pub use log::LogStore;
pub use read_cache::ReadCache;
pub use record::{RECORD_HEADER_SIZE, RecordHeader};
