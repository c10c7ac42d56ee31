//! Main key-value store implementation
//!
//! `Kv` routes operations across the hash index and the record log: a key
//! is hashed to a 64-bit fingerprint, the index resolves the fingerprint to
//! a log address, and the log reads or appends the record. A background
//! thread drains pending log flushes in small batches.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::common::{Config, Result};
use crate::file::PageFile;
use crate::index::HashIndex;
use crate::key_value::{LogKey, LogValue};
use crate::log::LogStore;

/// Default fingerprint: the first seven bytes of the key representation,
/// short keys padded with `'0'`, reinterpreted as a little-endian u64.
///
/// Weak but cheap; keys sharing a seven-byte prefix collide and resolve
/// through the log's back-link walk. Substitute a stronger mixer with
/// [`Kv::set_fingerprint_fn`] when the key shape calls for it.
pub fn default_fingerprint(repr: &[u8]) -> u64 {
    let mut bytes = [b'0'; 8];
    let take = repr.len().min(7);
    bytes[..take].copy_from_slice(&repr[..take]);
    bytes[7] = 0;
    u64::from_le_bytes(bytes)
}

/// The coordinator over the hash index and the record log.
///
/// All operations are serial on one writer; there is no multi-writer API.
pub struct Kv {
    #[allow(dead_code)]
    catalog: Catalog,
    index: HashIndex,
    log: LogStore,
    fingerprint: fn(&[u8]) -> u64,
    stop: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
    closed: bool,
}

impl Kv {
    /// Create a fresh store in `dir`, truncating any previous files and
    /// writing a new catalog.
    pub fn create<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self> {
        Self::init(dir.as_ref(), config, true)
    }

    /// Open an existing store from the catalog in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self> {
        Self::init(dir.as_ref(), config, false)
    }

    fn init(dir: &Path, config: Config, fresh: bool) -> Result<Self> {
        config.validate()?;
        let catalog = if fresh {
            Catalog::create(dir)?
        } else {
            Catalog::load(dir)?
        };
        let index_file = PageFile::open(catalog.index_path(), config.page_size, fresh)?;
        let data_file = Arc::new(PageFile::open(catalog.data_path(), config.page_size, fresh)?);
        let index = if fresh {
            HashIndex::create(index_file, &config)?
        } else {
            HashIndex::load(index_file, &config)?
        };
        let log = if fresh {
            LogStore::create(data_file, &config)?
        } else {
            LogStore::load(data_file, &config)?
        };

        let stop = Arc::new(AtomicBool::new(false));
        let flusher = Some(Self::spawn_flusher(&log, &config, stop.clone())?);
        log::info!("store {} at {}", if fresh { "created" } else { "opened" }, dir.display());
        Ok(Self {
            catalog,
            index,
            log,
            fingerprint: default_fingerprint,
            stop,
            flusher,
            closed: false,
        })
    }

    fn spawn_flusher(
        log_store: &LogStore,
        config: &Config,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let shared = log_store.flush_shared();
        let batch = config.flush_batch_limit;
        let wait = Duration::from_micros(config.flusher_wait_micros);
        let handle = std::thread::Builder::new()
            .name("flexkv-flusher".to_string())
            .spawn(move || {
                log::debug!("flusher thread started");
                while !stop.load(Ordering::Acquire) {
                    for _ in 0..batch {
                        match shared.background_flush(wait) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                log::error!("background flush failed: {e}");
                                break;
                            }
                        }
                    }
                    std::thread::sleep(Duration::from_nanos(60));
                }
                log::debug!("flusher thread stopped");
            })?;
        Ok(handle)
    }

    /// Replace the fingerprint function. Only sound on a store whose index
    /// was built with the same function.
    pub fn set_fingerprint_fn(&mut self, f: fn(&[u8]) -> u64) {
        self.fingerprint = f;
    }

    /// Look up the value stored for `key`.
    pub fn get<K: LogKey, V: LogValue>(&mut self, key: &K) -> Result<Option<V>> {
        let fp = (self.fingerprint)(key.repr().as_ref());
        let Some(addr) = self.index.get(fp)? else {
            return Ok(None);
        };
        self.log.get(addr, key)
    }

    /// Insert or overwrite the value for `key`.
    pub fn put<K: LogKey, V: LogValue>(&mut self, key: &K, value: &V) -> Result<()> {
        let fp = (self.fingerprint)(key.repr().as_ref());
        let prev = self.index.get(fp)?.unwrap_or(0);
        let addr = self.log.put(prev, key, value)?;
        self.index.upsert(fp, addr)?;
        Ok(())
    }

    /// Delete `key`, appending a tombstone. Returns whether a mapping was
    /// present.
    pub fn delete<K: LogKey>(&mut self, key: &K) -> Result<bool> {
        let fp = (self.fingerprint)(key.repr().as_ref());
        let Some(addr) = self.index.get(fp)? else {
            return Ok(false);
        };
        self.log.delete(addr, key)?;
        self.index.delete(fp)?;
        Ok(true)
    }

    /// Make everything written so far durable: drain the log flush queue,
    /// then persist both files' metadata.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.log.checkpoint()?;
        self.index.checkpoint()
    }

    /// Checkpoint, stop the flusher, and release all resources.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.checkpoint();
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        self.index.close()?;
        self.log.close();
        log::info!("store closed");
        result
    }

    #[cfg(test)]
    pub(crate) fn index(&mut self) -> &mut HashIndex {
        &mut self.index
    }
}

impl Drop for Kv {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.shutdown() {
                log::error!("close during drop failed: {e}");
            }
        }
    }
}
