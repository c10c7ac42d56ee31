//! Append-only record log
//!
//! Records land in a circular in-memory window over the log file; a flusher
//! drains whole pages behind the writer, and the window slides forward once
//! the flushed watermark has passed the pages being evicted. Records below
//! the window are served through the read-only page cache. Address 0 up to
//! one page is reserved: page 0 of the file holds `{page_size,
//! log_end_addr}`, rewritten at checkpoint.

pub mod flush;
pub mod window;

use std::sync::Arc;

use crate::common::{Config, KvError, Result};
use crate::file::PageFile;
use crate::key_value::{LogKey, LogValue};
use crate::read_cache::ReadCache;
use crate::record::{RECORD_HEADER_SIZE, RecordHeader};
use flush::FlushShared;
use window::Window;

fn next_boundary(addr: u64, page_size: u64) -> u64 {
    ((addr - 1) | (page_size - 1)) + 1
}

/// Outcome of examining one record during the collision walk.
enum Step<V> {
    Done(Option<V>),
    Follow(u64),
}

fn examine<K: LogKey, V: LogValue>(bytes: &[u8], key: &K) -> Step<V> {
    let header = RecordHeader::decode(bytes);
    let key_start = RECORD_HEADER_SIZE as usize;
    let key_end = key_start + header.key_len as usize;
    if key.matches_encoded(&bytes[key_start..key_end]) {
        if header.tombstone {
            Step::Done(None)
        } else {
            Step::Done(Some(V::decode(
                &bytes[key_end..key_end + header.value_len as usize],
            )))
        }
    } else {
        Step::Follow(header.prev_addr)
    }
}

/// The log storage engine.
pub struct LogStore {
    file: Arc<PageFile>,
    window: Arc<Window>,
    shared: Arc<FlushShared>,
    read_cache: ReadCache,
    page_size: u64,
    /// First address still resident in the window; moves only by whole
    /// pages.
    head_addr: u64,
    /// Next insertion byte.
    end_addr: u64,
    /// Page boundary up to which window slots hold current log pages.
    mapped_end: u64,
    /// Page boundary up to which flushes have been requested.
    last_flush_request: u64,
    /// Contiguous copy of the record currently wrapping the window end;
    /// a read fast path, reads reassemble from the buffer without it.
    span_record: Option<(u64, Vec<u8>)>,
}

impl LogStore {
    /// Set up a fresh log over a truncated file.
    pub fn create(file: Arc<PageFile>, config: &Config) -> Result<Self> {
        let page_size = config.page_size;
        let pages = config.log_window_pages;
        let window = Arc::new(Window::new(pages, page_size)?);
        file.set_len((pages + 1) * page_size)?;
        let shared = Arc::new(FlushShared::new(window.clone(), file.clone(), page_size));
        log::info!("fresh log: window of {pages} pages, page size {page_size}");
        Ok(Self {
            read_cache: ReadCache::new(config.read_cache_pages, page_size),
            window,
            shared,
            file,
            page_size,
            head_addr: page_size,
            end_addr: page_size,
            mapped_end: (pages + 1) * page_size,
            last_flush_request: page_size,
            span_record: None,
        })
    }

    /// Restore a log from the metadata in page 0 and re-read the window
    /// tail from the file.
    pub fn load(file: Arc<PageFile>, config: &Config) -> Result<Self> {
        let page_size = config.page_size;
        let pages = config.log_window_pages;

        let mut meta = [0u8; 16];
        file.read_exact_at(&mut meta, 0)?;
        let stored = u64::from_le_bytes(meta[0..8].try_into().unwrap());
        if stored != page_size {
            return Err(KvError::LoadMismatch {
                stored,
                configured: page_size,
            });
        }
        // A store checkpointed before any write records an end address of
        // one page; anything lower is treated as empty.
        let end_addr = u64::from_le_bytes(meta[8..16].try_into().unwrap()).max(page_size);

        let head_addr = if end_addr <= pages * page_size {
            page_size
        } else {
            next_boundary(end_addr, page_size) - (pages - 1) * page_size
        };
        let mapped_end = next_boundary(end_addr, page_size);

        let window = Arc::new(Window::new(pages, page_size)?);
        // Re-read the resident tail of the log into its slots; the
        // remainder of the end page stays zero.
        let mut addr = head_addr;
        while addr < end_addr {
            let slot = window.slot_of(addr);
            let run = ((window.pages() - slot) * page_size).min(end_addr - addr);
            let buf = unsafe { window.slice_mut(slot * page_size, run) };
            file.read_exact_at(buf, addr)?;
            addr += run;
        }

        let last_flush_request = end_addr - end_addr % page_size;
        let shared = Arc::new(FlushShared::new(
            window.clone(),
            file.clone(),
            last_flush_request,
        ));
        log::info!("log loaded: end address {end_addr}, window head {head_addr}");
        Ok(Self {
            read_cache: ReadCache::new(config.read_cache_pages, page_size),
            window,
            shared,
            file,
            page_size,
            head_addr,
            end_addr,
            mapped_end,
            last_flush_request,
            span_record: None,
        })
    }

    pub fn end_addr(&self) -> u64 {
        self.end_addr
    }

    /// Handle for the background flusher thread.
    pub(crate) fn flush_shared(&self) -> Arc<FlushShared> {
        self.shared.clone()
    }

    /// Wait up to `timeout` for pending pages and drain one batch. Returns
    /// whether any flush work happened.
    pub fn background_flush(&self, timeout: std::time::Duration) -> Result<bool> {
        self.shared.background_flush(timeout)
    }

    /// Append a record. Returns the address it was placed at.
    pub fn put<K: LogKey, V: LogValue>(
        &mut self,
        prev_addr: u64,
        key: &K,
        value: &V,
    ) -> Result<u64> {
        self.append(prev_addr, key, value.encoded_len(), false, |buf| {
            value.encode(buf)
        })
    }

    /// Append a tombstone (zero-length value) back-linking `prev_addr`.
    pub fn delete<K: LogKey>(&mut self, prev_addr: u64, key: &K) -> Result<u64> {
        if prev_addr >= self.end_addr {
            return Err(KvError::NotFound);
        }
        self.append(prev_addr, key, 0, true, |_| {})
    }

    fn append<K: LogKey>(
        &mut self,
        prev_addr: u64,
        key: &K,
        value_len: u32,
        tombstone: bool,
        write_value: impl FnOnce(&mut [u8]),
    ) -> Result<u64> {
        let key_len = key.encoded_len();
        let record_len = RECORD_HEADER_SIZE + key_len as u64 + value_len as u64;
        if record_len > self.window.len() {
            return Err(KvError::RecordTooLarge {
                size: record_len,
                window: self.window.len(),
            });
        }

        self.adjust_put_addr(record_len);
        let addr = self.end_addr;
        self.extend_window(record_len)?;

        // The back-link is stored as a distance so the chain walk can
        // subtract it; zero marks the end of the chain.
        let back = if prev_addr == 0 { 0 } else { addr - prev_addr };
        let header = RecordHeader::new(back, tombstone, key_len, value_len);
        let key_end = RECORD_HEADER_SIZE as usize + key_len as usize;
        let window_off = self.window.offset_of(addr);
        if window_off + record_len <= self.window.len() {
            let buf = unsafe { self.window.slice_mut(window_off, record_len) };
            buf[..RECORD_HEADER_SIZE as usize].copy_from_slice(&header.encode());
            key.encode(&mut buf[RECORD_HEADER_SIZE as usize..key_end]);
            write_value(&mut buf[key_end..]);
        } else {
            // The record wraps the circular end: materialize a contiguous
            // copy for reads, then place the two halves.
            let mut scratch = vec![0u8; record_len as usize];
            scratch[..RECORD_HEADER_SIZE as usize].copy_from_slice(&header.encode());
            key.encode(&mut scratch[RECORD_HEADER_SIZE as usize..key_end]);
            write_value(&mut scratch[key_end..]);
            let first = self.window.len() - window_off;
            unsafe {
                self.window
                    .slice_mut(window_off, first)
                    .copy_from_slice(&scratch[..first as usize]);
                self.window
                    .slice_mut(0, record_len - first)
                    .copy_from_slice(&scratch[first as usize..]);
            }
            self.span_record = Some((addr, scratch));
        }

        self.request_flush_after_write();
        Ok(addr)
    }

    /// Padding rule: move the insertion point to the next page boundary
    /// when starting fresh saves a page of span, or when the residue could
    /// not even hold the header (it is never split across pages).
    fn adjust_put_addr(&mut self, record_len: u64) {
        let page_size = self.page_size;
        let span = (record_len - 1) / page_size + 1;
        let residue = page_size - ((self.end_addr - 1) % page_size + 1);
        if residue < record_len {
            let extra = (record_len - residue - 1) / page_size + 1;
            if span < extra + 1 || residue < RECORD_HEADER_SIZE {
                self.end_addr = next_boundary(self.end_addr, page_size);
                if self.end_addr == self.last_flush_request + page_size {
                    self.shared.request(1);
                    self.last_flush_request = self.end_addr;
                }
            }
        }
    }

    /// Advance the end past the new record, evicting head pages (after the
    /// flusher catches up) and zeroing the slots the record grows into.
    fn extend_window(&mut self, record_len: u64) -> Result<()> {
        let page_size = self.page_size;
        let pages = self.window.pages();
        self.end_addr += record_len;

        let new_mapped_end = next_boundary(self.end_addr, page_size);
        let occupancy = (new_mapped_end - self.head_addr) / page_size;
        let evict = occupancy.saturating_sub(pages);
        if evict > 0 {
            let needed = self.head_addr + evict * page_size;
            while self.shared.persist_addr() < needed {
                if !self.shared.try_flush()? {
                    break;
                }
                std::thread::yield_now();
            }
            if self.shared.persist_addr() < needed {
                // The queue is empty but the watermark still trails (a
                // record spanning nearly the whole window); persist the
                // remainder directly.
                self.flush_window_range(self.shared.persist_addr(), needed)?;
                self.shared.reset_persist_addr(needed);
            }
            self.head_addr = needed;
            if let Some((span_addr, _)) = self.span_record
                && span_addr < self.head_addr
            {
                self.span_record = None;
            }
        }

        if new_mapped_end > self.mapped_end {
            self.zero_slots(self.mapped_end, new_mapped_end);
            self.mapped_end = new_mapped_end;
        }
        Ok(())
    }

    fn flush_window_range(&self, from: u64, to: u64) -> Result<()> {
        let page_size = self.page_size;
        let mut addr = from;
        while addr < to {
            let slot = self.window.slot_of(addr);
            let run = ((self.window.pages() - slot) * page_size).min(to - addr);
            let buf = unsafe { self.window.slice(slot * page_size, run) };
            self.file.write_all_at(buf, addr)?;
            addr += run;
        }
        self.file.sync_data()
    }

    fn zero_slots(&mut self, from: u64, to: u64) {
        let page_size = self.page_size;
        let mut addr = from;
        while addr < to {
            let slot = self.window.slot_of(addr);
            let run = ((self.window.pages() - slot) * page_size).min(to - addr);
            unsafe { self.window.slice_mut(slot * page_size, run) }.fill(0);
            addr += run;
        }
    }

    fn request_flush_after_write(&mut self) {
        let page_size = self.page_size;
        if self.end_addr - self.last_flush_request > page_size {
            let count = (self.end_addr - self.last_flush_request) / page_size;
            self.shared.request(count);
            self.last_flush_request += count * page_size;
        }
    }

    /// Read the record at `addr`, walking `prev_addr` links until the
    /// stored key matches. The chain terminates at a zero back-link.
    pub fn get<K: LogKey, V: LogValue>(&mut self, addr: u64, key: &K) -> Result<Option<V>> {
        let mut addr = addr;
        loop {
            if addr < self.page_size || addr >= self.end_addr {
                return Ok(None);
            }

            let step: Step<V> = if matches!(&self.span_record, Some((a, _)) if *a == addr) {
                examine(&self.span_record.as_ref().unwrap().1, key)
            } else if addr >= self.head_addr {
                let mut header_buf = [0u8; RECORD_HEADER_SIZE as usize];
                self.copy_from_window(addr, &mut header_buf);
                let len = RecordHeader::decode(&header_buf).record_len();
                let off = self.window.offset_of(addr);
                if off + len <= self.window.len() {
                    examine(unsafe { self.window.slice(off, len) }, key)
                } else {
                    // The record wraps the buffer end and its scratch copy
                    // is gone (a reopened store never has one); rebuild a
                    // contiguous view from the two halves.
                    let mut assembled = vec![0u8; len as usize];
                    self.copy_from_window(addr, &mut assembled);
                    examine(&assembled, key)
                }
            } else {
                self.examine_cold(addr, key)?
            };

            match step {
                Step::Done(value) => return Ok(value),
                Step::Follow(prev) => {
                    if prev == 0 {
                        return Ok(None);
                    }
                    addr -= prev;
                }
            }
        }
    }

    /// Examine a record below the window through the read-only cache. A
    /// record the head has advanced into keeps its tail in the window;
    /// those are reassembled into a contiguous scratch.
    fn examine_cold<K: LogKey, V: LogValue>(&mut self, addr: u64, key: &K) -> Result<Step<V>> {
        let head = self.head_addr;
        let Self {
            read_cache, file, ..
        } = self;

        let probe = read_cache.get(file, addr, RECORD_HEADER_SIZE)?;
        let len = RecordHeader::decode(probe).record_len();

        if addr + len > head {
            let below = (head - addr) as usize;
            let mut assembled = vec![0u8; len as usize];
            let bytes = read_cache.get(file, addr, below as u64)?;
            assembled[..below].copy_from_slice(&bytes[..below]);
            self.copy_from_window(head, &mut assembled[below..]);
            return Ok(examine(&assembled, key));
        }

        let bytes = if (probe.len() as u64) < len {
            read_cache.get(file, addr, len)?
        } else {
            read_cache.get(file, addr, RECORD_HEADER_SIZE)?
        };
        Ok(examine(bytes, key))
    }

    fn copy_from_window(&self, addr: u64, out: &mut [u8]) {
        let mut at = 0usize;
        let mut addr = addr;
        while at < out.len() {
            let off = self.window.offset_of(addr);
            let run = ((self.window.len() - off) as usize).min(out.len() - at);
            out[at..at + run].copy_from_slice(unsafe { self.window.slice(off, run as u64) });
            addr += run as u64;
            at += run;
        }
    }

    /// Drain the flush queue, persist the page carrying the end address,
    /// and rewrite the metadata page.
    pub fn checkpoint(&mut self) -> Result<()> {
        let end = self.end_addr;
        self.shared.drain()?;

        if end > self.head_addr {
            // The page holding the last written byte is never part of a
            // flush request; persist it directly.
            let page_start = (end - 1) & !(self.page_size - 1);
            let slot = self.window.slot_of(page_start);
            let buf = unsafe { self.window.page_run(slot, 1) };
            self.file.write_all_at(buf, page_start)?;
        }

        let mut meta = [0u8; 16];
        meta[0..8].copy_from_slice(&self.page_size.to_le_bytes());
        meta[8..16].copy_from_slice(&end.to_le_bytes());
        self.file.write_all_at(&meta, 0)?;
        self.file.sync_data()?;
        log::info!("log checkpoint at end address {end}");
        Ok(())
    }

    /// Release the read cache and the straddle scratch.
    pub fn close(&mut self) {
        self.read_cache.close();
        self.span_record = None;
    }
}
