//! Extendible hash index
//!
//! Maps 64-bit fingerprints to log addresses. Hash pages live in a file and
//! are cached in a fixed pool of writable mappings; the directory doubles
//! and pages split lazily as buckets fill. Within a page the first half of
//! the buckets are primary (addressed by the fingerprint), the second half
//! are overflow buckets handed out by a per-page cursor; the last entry of
//! every bucket is the overflow link and is never taken by a record.
//!
//! The index has one active writer. `&mut self` receivers enforce that
//! contract; parallel readers are not supported because lookups mutate the
//! LRU order of the page pool.

pub mod entry;
pub mod page_pool;

use crate::common::{
    Config, ENTRIES_PER_BUCKET, HASH_ENTRY_SIZE, INDEX_META_PAGES, KvError, Result,
};
use crate::file::PageFile;
use entry::HashEntry;
use page_pool::PagePool;

/// File offset marker for a directory entry with no page yet.
pub const PAGE_UNALLOCATED: u64 = u64::MAX;

const INDEX_HEADER_SIZE: usize = 24;
const DIR_ENTRY_DISK_SIZE: usize = 24;

/// One directory entry. `file_offset` is the logical page index of the hash
/// page in the file, `slot` its position in the in-memory pool when
/// resident.
#[derive(Debug, Clone, Copy)]
struct DirEntry {
    local_depth: u64,
    overflow_cursor: u64,
    file_offset: u64,
    slot: Option<usize>,
}

/// Result of walking a bucket chain for a fingerprint.
enum Probe {
    /// An entry with matching validation bits (possibly deleted).
    Matched { bucket: u64, pos: u64 },
    /// First free slot in the chain; `reserved` is an earlier deleted slot.
    Free {
        bucket: u64,
        pos: u64,
        reserved: Option<(u64, u64)>,
    },
    /// The chain ended at a link slot with no overflow bucket.
    ChainEnd {
        last_bucket: u64,
        reserved: Option<(u64, u64)>,
    },
}

/// Walk the chain rooted at the fingerprint's primary bucket.
fn probe(page: &[u8], fp: u64, buckets_per_page: u64, local_depth: u64) -> Probe {
    let b = buckets_per_page / 2;
    let valid = (fp / b) >> local_depth;
    let mut bucket = fp % b;
    let mut pos = 0u64;
    let mut reserved = None;

    loop {
        if pos == ENTRIES_PER_BUCKET - 1 {
            let link = HashEntry::load(page, bucket * ENTRIES_PER_BUCKET + pos);
            let overflow = link.overflow_bucket(buckets_per_page);
            if overflow == 0 {
                return Probe::ChainEnd {
                    last_bucket: bucket,
                    reserved,
                };
            }
            bucket = overflow;
            pos = 0;
            continue;
        }
        let entry = HashEntry::load(page, bucket * ENTRIES_PER_BUCKET + pos);
        if !entry.taken() {
            return Probe::Free {
                bucket,
                pos,
                reserved,
            };
        }
        if entry.validation(buckets_per_page, local_depth) == valid {
            return Probe::Matched { bucket, pos };
        }
        if entry.deleted() && reserved.is_none() {
            reserved = Some((bucket, pos));
        }
        pos += 1;
    }
}

fn set_page_local_depth(page: &mut [u8], entries_per_page: u64, local_depth: u64) {
    let mut entry = HashEntry::load(page, entries_per_page - 1);
    entry.set_address(local_depth);
    entry.store(page, entries_per_page - 1);
}

/// Cursor for writing routed entries into a destination page during a
/// split, chaining overflow buckets as each bucket fills.
struct SplitCursor {
    bucket: u64,
    pos: u64,
}

impl SplitCursor {
    fn new(bucket: u64) -> Self {
        Self { bucket, pos: 0 }
    }

    fn write(&mut self, page: &mut [u8], entry: HashEntry, cursor: &mut u64, buckets_per_page: u64) {
        if self.pos == ENTRIES_PER_BUCKET - 1 {
            let link_at = self.bucket * ENTRIES_PER_BUCKET + self.pos;
            let mut link = HashEntry::load(page, link_at);
            link.set_overflow_bucket(*cursor);
            link.store(page, link_at);
            self.bucket = *cursor;
            self.pos = 0;
            *cursor += 1;
        }
        entry.store(page, self.bucket * ENTRIES_PER_BUCKET + self.pos);
        self.pos += 1;
    }
}

/// Route every live entry of `src` into either `scratch` (the rebuilt
/// source page) or `target`, based on the directory bit the split exposes.
/// Returns the overflow cursors the two pages end up with.
fn split_page(
    src: &[u8],
    scratch: &mut [u8],
    target: &mut [u8],
    buckets_per_page: u64,
    local_depth: u64,
) -> (u64, u64) {
    let b = buckets_per_page / 2;
    let route_bit = b << local_depth;
    let mut cursors = [b, b];

    for primary in 0..b {
        let mut writers = [SplitCursor::new(primary), SplitCursor::new(primary)];
        let mut bucket = primary;
        let mut pos = 0u64;
        loop {
            if pos == ENTRIES_PER_BUCKET - 1 {
                let link = HashEntry::load(src, bucket * ENTRIES_PER_BUCKET + pos);
                let overflow = link.overflow_bucket(buckets_per_page);
                if overflow == 0 {
                    break;
                }
                bucket = overflow;
                pos = 0;
                continue;
            }
            let entry = HashEntry::load(src, bucket * ENTRIES_PER_BUCKET + pos);
            if !entry.taken() {
                break;
            }
            if !entry.deleted() {
                let dest = usize::from(entry.hash_word() & route_bit != 0);
                let mut routed = entry;
                routed.clear_overflow_bucket(buckets_per_page);
                let page: &mut [u8] = if dest == 1 { &mut *target } else { &mut *scratch };
                writers[dest].write(page, routed, &mut cursors[dest], buckets_per_page);
            }
            pos += 1;
        }
    }
    (cursors[0], cursors[1])
}

/// The extendible hash index.
pub struct HashIndex {
    file: PageFile,
    page_size: u64,
    buckets_per_page: u64,
    entries_per_page: u64,
    global_depth: u64,
    /// Logical index of the next hash page to allocate in the file; the
    /// metadata prefix owns everything below it at start.
    pages_allocated: u64,
    dir: Vec<DirEntry>,
    pool: PagePool,
}

impl HashIndex {
    /// Set up a fresh index over a truncated file.
    pub fn create(file: PageFile, config: &Config) -> Result<Self> {
        let page_size = config.page_size;
        let global_depth = config.initial_directory_size.trailing_zeros() as u64;
        let buckets_per_page = page_size / crate::common::CACHE_LINE_SIZE;
        let dir = vec![
            DirEntry {
                local_depth: global_depth,
                overflow_cursor: buckets_per_page / 2,
                file_offset: PAGE_UNALLOCATED,
                slot: None,
            };
            config.initial_directory_size as usize
        ];
        log::info!(
            "fresh hash index: directory size {}, page size {}",
            config.initial_directory_size,
            page_size
        );
        Ok(Self {
            file,
            page_size,
            buckets_per_page,
            entries_per_page: page_size / HASH_ENTRY_SIZE,
            global_depth,
            pages_allocated: INDEX_META_PAGES,
            dir,
            pool: PagePool::new(config.index_pool_slots),
        })
    }

    /// Restore an index from the metadata prefix written by `checkpoint`.
    pub fn load(file: PageFile, config: &Config) -> Result<Self> {
        let page_size = config.page_size;
        let mut header = [0u8; INDEX_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        let stored = u64::from_le_bytes(header[0..8].try_into().unwrap());
        if stored != page_size {
            return Err(KvError::LoadMismatch {
                stored,
                configured: page_size,
            });
        }
        let pages_allocated = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let global_depth = u64::from_le_bytes(header[16..24].try_into().unwrap());

        let dir_len = 1usize << global_depth;
        let mut raw = vec![0u8; dir_len * DIR_ENTRY_DISK_SIZE];
        file.read_exact_at(&mut raw, INDEX_HEADER_SIZE as u64)?;
        let mut dir = Vec::with_capacity(dir_len);
        for chunk in raw.chunks_exact(DIR_ENTRY_DISK_SIZE) {
            dir.push(DirEntry {
                local_depth: u32::from_le_bytes(chunk[0..4].try_into().unwrap()) as u64,
                overflow_cursor: u32::from_le_bytes(chunk[4..8].try_into().unwrap()) as u64,
                file_offset: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
                slot: None,
            });
        }
        log::info!(
            "hash index loaded: global depth {}, {} pages allocated",
            global_depth,
            pages_allocated
        );
        Ok(Self {
            file,
            page_size,
            buckets_per_page: page_size / crate::common::CACHE_LINE_SIZE,
            entries_per_page: page_size / HASH_ENTRY_SIZE,
            global_depth,
            pages_allocated,
            dir,
            pool: PagePool::new(config.index_pool_slots),
        })
    }

    pub fn global_depth(&self) -> u64 {
        self.global_depth
    }

    pub fn pages_allocated(&self) -> u64 {
        self.pages_allocated
    }

    fn dir_idx(&self, fp: u64) -> usize {
        ((fp / (self.buckets_per_page / 2)) & ((1 << self.global_depth) - 1)) as usize
    }

    /// The canonical directory entry owning the fingerprint's page; after a
    /// split recorded only in the high half, this re-resolves through the
    /// entry's own local depth.
    fn ref_dir_idx(&self, fp: u64) -> usize {
        let local_depth = self.dir[self.dir_idx(fp)].local_depth;
        ((fp / (self.buckets_per_page / 2)) & ((1 << local_depth) - 1)) as usize
    }

    /// Make the page of directory entry `idx` resident, evicting through
    /// the pool if necessary.
    fn ensure_page(&mut self, idx: usize) -> Result<usize> {
        if let Some(slot) = self.dir[idx].slot {
            self.pool.touch(slot);
            return Ok(slot);
        }
        let offset = self.dir[idx].file_offset * self.page_size;
        let (slot, evicted) = self
            .pool
            .acquire(&self.file, offset, idx as u32, self.page_size)?;
        if let Some(owner) = evicted {
            self.dir[owner as usize].slot = None;
        }
        self.dir[idx].slot = Some(slot);
        Ok(slot)
    }

    /// Give directory entry `idx` its first page, zeroed, with the current
    /// local depth stamped into the page's last entry.
    fn allocate_page(&mut self, idx: usize) -> Result<()> {
        self.dir[idx].file_offset = self.pages_allocated;
        self.pages_allocated += 1;
        let slot = self.ensure_page(idx)?;
        let local_depth = self.dir[idx].local_depth;
        let entries_per_page = self.entries_per_page;
        let page = self.pool.page_mut(slot);
        page.fill(0);
        set_page_local_depth(page, entries_per_page, local_depth);
        self.pool.mark_dirty(slot);
        log::debug!(
            "allocated hash page {} for directory entry {}",
            self.dir[idx].file_offset,
            idx
        );
        Ok(())
    }

    /// Return the log address most recently associated with `fp`.
    pub fn get(&mut self, fp: u64) -> Result<Option<u64>> {
        let idx = self.ref_dir_idx(fp);
        if self.dir[idx].file_offset == PAGE_UNALLOCATED {
            return Ok(None);
        }
        let slot = self.ensure_page(idx)?;
        let local_depth = self.dir[idx].local_depth;
        let page = self.pool.page(slot);
        match probe(page, fp, self.buckets_per_page, local_depth) {
            Probe::Matched { bucket, pos } => {
                let entry = HashEntry::load(page, bucket * ENTRIES_PER_BUCKET + pos);
                if entry.deleted() {
                    Ok(None)
                } else {
                    Ok(Some(entry.address()))
                }
            }
            _ => Ok(None),
        }
    }

    /// Insert a new mapping. If the fingerprint is already present and not
    /// deleted, fails with `Exists` carrying the current address.
    pub fn put(&mut self, fp: u64, addr: u64) -> Result<()> {
        self.insert(fp, addr, false).map(|_| ())
    }

    /// Overwrite-or-insert. On overwrite the previous address is returned.
    pub fn upsert(&mut self, fp: u64, addr: u64) -> Result<Option<u64>> {
        self.insert(fp, addr, true)
    }

    fn insert(&mut self, fp: u64, addr: u64, overwrite: bool) -> Result<Option<u64>> {
        loop {
            let idx = self.ref_dir_idx(fp);
            if self.dir[idx].file_offset == PAGE_UNALLOCATED {
                self.allocate_page(idx)?;
            }
            let slot = self.ensure_page(idx)?;
            let buckets_per_page = self.buckets_per_page;
            let local_depth = self.dir[idx].local_depth;

            match probe(self.pool.page(slot), fp, buckets_per_page, local_depth) {
                Probe::Matched { bucket, pos } => {
                    let at = bucket * ENTRIES_PER_BUCKET + pos;
                    let page = self.pool.page_mut(slot);
                    let mut entry = HashEntry::load(page, at);
                    if entry.deleted() {
                        entry.inc_chain();
                        entry.clear_deleted();
                        entry.set_address(addr);
                        entry.store(page, at);
                        self.pool.mark_dirty(slot);
                        return Ok(None);
                    }
                    if !overwrite {
                        return Err(KvError::Exists {
                            address: entry.address(),
                        });
                    }
                    let old = entry.address();
                    entry.inc_chain();
                    entry.set_address(addr);
                    entry.store(page, at);
                    self.pool.mark_dirty(slot);
                    return Ok(Some(old));
                }
                Probe::Free {
                    bucket,
                    pos,
                    reserved,
                } => {
                    let (bucket, pos, resurrect) = match reserved {
                        Some((rb, rp)) => (rb, rp, true),
                        None => (bucket, pos, false),
                    };
                    self.write_new_entry(slot, fp, addr, bucket, pos, local_depth, resurrect);
                    return Ok(None);
                }
                Probe::ChainEnd {
                    last_bucket,
                    reserved,
                } => {
                    if let Some((rb, rp)) = reserved {
                        self.write_new_entry(slot, fp, addr, rb, rp, local_depth, true);
                        return Ok(None);
                    }
                    if self.dir[idx].overflow_cursor < buckets_per_page {
                        let new_bucket = self.dir[idx].overflow_cursor;
                        self.dir[idx].overflow_cursor += 1;
                        let page = self.pool.page_mut(slot);
                        let link_at = last_bucket * ENTRIES_PER_BUCKET + (ENTRIES_PER_BUCKET - 1);
                        let mut link = HashEntry::load(page, link_at);
                        link.set_overflow_bucket(new_bucket);
                        link.store(page, link_at);
                        self.write_new_entry(slot, fp, addr, new_bucket, 0, local_depth, false);
                        return Ok(None);
                    }
                    // Page exhausted: split it (doubling the directory if
                    // needed) and retry against the new layout.
                    self.extend(fp)?;
                }
            }
        }
    }

    fn write_new_entry(
        &mut self,
        slot: usize,
        fp: u64,
        addr: u64,
        bucket: u64,
        pos: u64,
        local_depth: u64,
        resurrect: bool,
    ) {
        let buckets_per_page = self.buckets_per_page;
        let at = bucket * ENTRIES_PER_BUCKET + pos;
        let page = self.pool.page_mut(slot);
        let mut entry = HashEntry::load(page, at);
        entry.inc_chain();
        if resurrect {
            entry.clear_deleted();
        } else {
            entry.set_taken();
        }
        entry.set_address(addr);
        entry.set_validation(fp, buckets_per_page, local_depth);
        entry.store(page, at);
        self.pool.mark_dirty(slot);
    }

    /// Mark the fingerprint deleted; returns the address the entry pointed
    /// at just before deletion.
    pub fn delete(&mut self, fp: u64) -> Result<Option<u64>> {
        let idx = self.ref_dir_idx(fp);
        if self.dir[idx].file_offset == PAGE_UNALLOCATED {
            return Ok(None);
        }
        let slot = self.ensure_page(idx)?;
        let local_depth = self.dir[idx].local_depth;
        match probe(self.pool.page(slot), fp, self.buckets_per_page, local_depth) {
            Probe::Matched { bucket, pos } => {
                let at = bucket * ENTRIES_PER_BUCKET + pos;
                let page = self.pool.page_mut(slot);
                let mut entry = HashEntry::load(page, at);
                if entry.deleted() {
                    return Ok(None);
                }
                entry.dec_chain();
                if entry.chain_length() == 0 {
                    entry.set_deleted();
                }
                let addr = entry.address();
                entry.store(page, at);
                self.pool.mark_dirty(slot);
                Ok(Some(addr))
            }
            _ => Ok(None),
        }
    }

    /// Split the page owning `fp`, doubling the directory first when its
    /// local depth has reached the global depth.
    pub fn extend(&mut self, fp: u64) -> Result<()> {
        let b = self.buckets_per_page / 2;
        let idx = self.ref_dir_idx(fp);
        if self.dir[idx].file_offset == PAGE_UNALLOCATED {
            return Ok(());
        }
        if self.dir[idx].local_depth == self.global_depth {
            self.double_directory()?;
        }

        let idx = self.ref_dir_idx(fp);
        let local_depth = self.dir[idx].local_depth;
        let stride = 1usize << local_depth;
        let target_idx = idx + stride;

        // Every alias of the source entry, in both halves, moves one level
        // deeper.
        let mut i = idx;
        while i < self.dir.len() {
            self.dir[i].local_depth += 1;
            i += stride;
        }
        let new_depth = local_depth + 1;

        self.dir[target_idx].file_offset = self.pages_allocated;
        self.pages_allocated += 1;
        self.dir[target_idx].overflow_cursor = b;

        let src_slot = self.ensure_page(idx)?;
        self.pool.mark_dirty(src_slot);
        let src_copy = self.pool.page(src_slot).to_vec();

        let target_slot = self.ensure_page(target_idx)?;
        // Acquiring the target can displace the source from a small pool.
        let src_slot = self.ensure_page(idx)?;
        self.pool.touch(target_slot);

        let entries_per_page = self.entries_per_page;
        let mut scratch = vec![0u8; self.page_size as usize];
        set_page_local_depth(&mut scratch, entries_per_page, new_depth);

        let buckets_per_page = self.buckets_per_page;
        let (src_cursor, target_cursor) = {
            let target_page = self.pool.page_mut(target_slot);
            target_page.fill(0);
            set_page_local_depth(target_page, entries_per_page, new_depth);
            split_page(
                &src_copy,
                &mut scratch,
                target_page,
                buckets_per_page,
                local_depth,
            )
        };
        self.pool.mark_dirty(target_slot);
        self.dir[idx].overflow_cursor = src_cursor;
        self.dir[target_idx].overflow_cursor = target_cursor;

        self.pool.page_mut(src_slot).copy_from_slice(&scratch);
        self.pool.mark_dirty(src_slot);

        log::debug!(
            "split page of directory entry {} into {} at depth {}",
            idx,
            target_idx,
            new_depth
        );
        Ok(())
    }

    fn double_directory(&mut self) -> Result<()> {
        let prev = self.dir.len();
        let needed = INDEX_HEADER_SIZE + 2 * prev * DIR_ENTRY_DISK_SIZE;
        if needed as u64 > INDEX_META_PAGES * self.page_size {
            log::error!("directory of {} entries cannot double within the metadata prefix", prev);
            return Err(KvError::AllocationFailed { size: needed });
        }
        let mut dir = Vec::new();
        dir.try_reserve_exact(2 * prev)
            .map_err(|_| KvError::AllocationFailed {
                size: 2 * prev * std::mem::size_of::<DirEntry>(),
            })?;
        dir.extend_from_slice(&self.dir);
        // The new half only learns its local depth; page sharing stays
        // expressed through the canonical low-half entries.
        for i in 0..prev {
            dir.push(DirEntry {
                local_depth: self.dir[i].local_depth,
                overflow_cursor: 0,
                file_offset: PAGE_UNALLOCATED,
                slot: None,
            });
        }
        self.dir = dir;
        self.global_depth += 1;
        log::debug!("directory doubled to 2^{} entries", self.global_depth);
        Ok(())
    }

    /// Flush all dirty pages and persist the header and directory into the
    /// file's reserved prefix.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.pool.flush_all()?;

        let len = INDEX_HEADER_SIZE + self.dir.len() * DIR_ENTRY_DISK_SIZE;
        if len as u64 > INDEX_META_PAGES * self.page_size {
            return Err(KvError::Io(std::io::Error::other(
                "directory exceeds the reserved metadata prefix",
            )));
        }
        let mut meta = vec![0u8; len];
        meta[0..8].copy_from_slice(&self.page_size.to_le_bytes());
        meta[8..16].copy_from_slice(&self.pages_allocated.to_le_bytes());
        meta[16..24].copy_from_slice(&self.global_depth.to_le_bytes());
        for (i, de) in self.dir.iter().enumerate() {
            let at = INDEX_HEADER_SIZE + i * DIR_ENTRY_DISK_SIZE;
            meta[at..at + 4].copy_from_slice(&(de.local_depth as u32).to_le_bytes());
            meta[at + 4..at + 8].copy_from_slice(&(de.overflow_cursor as u32).to_le_bytes());
            meta[at + 8..at + 16].copy_from_slice(&de.file_offset.to_le_bytes());
        }
        self.file.write_all_at(&meta, 0)?;
        self.file.sync_data()?;
        log::info!(
            "index checkpoint: global depth {}, {} pages allocated",
            self.global_depth,
            self.pages_allocated
        );
        Ok(())
    }

    /// Flush a single LRU dirty page. Advisory; the coordinator does not
    /// schedule it.
    pub fn background_flush(&mut self) -> Result<bool> {
        self.pool.flush_lru_dirty()
    }

    /// Flush whatever is dirty and release every mapping.
    pub fn close(&mut self) -> Result<()> {
        self.pool.close()
    }

    #[cfg(test)]
    fn check_invariants(&mut self) {
        use std::collections::HashMap;

        let mut depth_by_offset: HashMap<u64, u64> = HashMap::new();
        for de in &self.dir {
            assert!(de.local_depth <= self.global_depth);
            if de.file_offset != PAGE_UNALLOCATED {
                let prev = depth_by_offset.insert(de.file_offset, de.local_depth);
                if let Some(prev) = prev {
                    assert_eq!(prev, de.local_depth);
                }
            }
        }

        // Link slots never hold records, and live entries validate against
        // their owner's depth window.
        let canonical: Vec<usize> = (0..self.dir.len())
            .filter(|&i| {
                self.dir[i].file_offset != PAGE_UNALLOCATED
                    && i == (i & ((1usize << self.dir[i].local_depth) - 1))
            })
            .collect();
        for idx in canonical {
            let slot = self.ensure_page(idx).unwrap();
            let page = self.pool.page(slot);
            for bucket in 0..self.buckets_per_page {
                let link =
                    HashEntry::load(page, bucket * ENTRIES_PER_BUCKET + (ENTRIES_PER_BUCKET - 1));
                assert!(!link.taken(), "link slot of bucket {bucket} taken");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> Config {
        Config {
            initial_directory_size: 2,
            index_pool_slots: 8,
            ..Config::default()
        }
    }

    fn fixture(config: &Config) -> (TempDir, HashIndex) {
        let dir = TempDir::new().unwrap();
        let file = PageFile::open(dir.path().join("index.bin"), config.page_size, true).unwrap();
        let index = HashIndex::create(file, config).unwrap();
        (dir, index)
    }

    /// Fingerprint with the given primary bucket, directory bits, and
    /// payload right above them, so splits redistribute by payload bits
    /// (b = 32 primary buckets for 4 KiB pages).
    fn fp(bucket: u64, dir_bits: u64, payload: u64) -> u64 {
        bucket + 32 * (dir_bits + (payload << 1))
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, mut index) = fixture(&small_config());
        index.put(fp(3, 0, 1), 0x1000).unwrap();
        index.put(fp(3, 0, 2), 0x2000).unwrap();
        assert_eq!(index.get(fp(3, 0, 1)).unwrap(), Some(0x1000));
        assert_eq!(index.get(fp(3, 0, 2)).unwrap(), Some(0x2000));
        assert_eq!(index.get(fp(3, 0, 3)).unwrap(), None);
        assert_eq!(index.get(fp(4, 0, 1)).unwrap(), None);
    }

    #[test]
    fn test_put_reports_existing_address() {
        let (_dir, mut index) = fixture(&small_config());
        index.put(fp(0, 0, 7), 0x1000).unwrap();
        match index.put(fp(0, 0, 7), 0x2000) {
            Err(KvError::Exists { address }) => assert_eq!(address, 0x1000),
            other => panic!("expected Exists, got {other:?}"),
        }
        // The stored address is unchanged.
        assert_eq!(index.get(fp(0, 0, 7)).unwrap(), Some(0x1000));
    }

    #[test]
    fn test_upsert_returns_previous_address() {
        let (_dir, mut index) = fixture(&small_config());
        assert_eq!(index.upsert(fp(1, 0, 9), 0x1000).unwrap(), None);
        assert_eq!(index.upsert(fp(1, 0, 9), 0x2000).unwrap(), Some(0x1000));
        assert_eq!(index.get(fp(1, 0, 9)).unwrap(), Some(0x2000));
    }

    #[test]
    fn test_delete_and_resurrect() {
        let (_dir, mut index) = fixture(&small_config());
        let f = fp(5, 1, 3);
        index.put(f, 0x1000).unwrap();
        assert_eq!(index.delete(f).unwrap(), Some(0x1000));
        assert_eq!(index.get(f).unwrap(), None);
        assert_eq!(index.delete(f).unwrap(), None);

        // Re-insert through the deleted slot.
        index.put(f, 0x3000).unwrap();
        assert_eq!(index.get(f).unwrap(), Some(0x3000));
    }

    #[test]
    fn test_deleted_slot_reserved_for_other_fingerprint() {
        let (_dir, mut index) = fixture(&small_config());
        // Fill one bucket's three record slots.
        for payload in 1..=3 {
            index.put(fp(2, 0, payload), payload * 0x10).unwrap();
        }
        index.delete(fp(2, 0, 2)).unwrap();

        // The newcomer lands in the reserved hole, not a fresh overflow
        // bucket.
        index.put(fp(2, 0, 9), 0x90).unwrap();
        assert_eq!(index.get(fp(2, 0, 9)).unwrap(), Some(0x90));
        assert_eq!(index.get(fp(2, 0, 1)).unwrap(), Some(0x10));
        assert_eq!(index.get(fp(2, 0, 3)).unwrap(), Some(0x30));
        assert_eq!(index.get(fp(2, 0, 2)).unwrap(), None);
        index.check_invariants();
    }

    #[test]
    fn test_overflow_chain() {
        let (_dir, mut index) = fixture(&small_config());
        // Twenty entries in one bucket need several overflow buckets.
        for payload in 1..=20 {
            index.put(fp(6, 0, payload), payload).unwrap();
        }
        for payload in 1..=20 {
            assert_eq!(index.get(fp(6, 0, payload)).unwrap(), Some(payload));
        }
        index.check_invariants();
    }

    #[test]
    fn test_split_and_directory_doubling() {
        let (_dir, mut index) = fixture(&small_config());
        let before = index.global_depth();

        // One bucket chain holds 3 + 32 * 3 = 99 live entries; more forces a
        // split, and the splitting page starts at the global depth.
        let n = 150u64;
        for payload in 1..=n {
            index.upsert(fp(0, 0, payload), payload).unwrap();
        }
        assert!(index.global_depth() > before);
        for payload in 1..=n {
            assert_eq!(index.get(fp(0, 0, payload)).unwrap(), Some(payload));
        }
        index.check_invariants();
    }

    #[test]
    fn test_split_drops_deleted_entries() {
        let (_dir, mut index) = fixture(&small_config());
        for payload in 1..=99 {
            index.put(fp(0, 0, payload), payload).unwrap();
        }
        for payload in 1..=10 {
            index.delete(fp(0, 0, payload)).unwrap();
        }
        // Split while the deleted holes are still in the chain.
        index.extend(fp(0, 0, 1)).unwrap();
        for payload in 1..=10 {
            assert_eq!(index.get(fp(0, 0, payload)).unwrap(), None);
        }
        for payload in 11..=99 {
            assert_eq!(index.get(fp(0, 0, payload)).unwrap(), Some(payload));
        }
        index.check_invariants();
    }

    #[test]
    fn test_pages_spread_across_directory() {
        let (_dir, mut index) = fixture(&small_config());
        for dir_bits in 0..2 {
            for bucket in 0..32 {
                index.put(fp(bucket, dir_bits, 1), bucket + 100 * dir_bits).unwrap();
            }
        }
        assert_eq!(index.pages_allocated(), INDEX_META_PAGES + 2);
        for dir_bits in 0..2 {
            for bucket in 0..32 {
                assert_eq!(
                    index.get(fp(bucket, dir_bits, 1)).unwrap(),
                    Some(bucket + 100 * dir_bits)
                );
            }
        }
    }

    #[test]
    fn test_eviction_through_small_pool() {
        let config = Config {
            initial_directory_size: 8,
            index_pool_slots: 2,
            ..Config::default()
        };
        let (_dir, mut index) = fixture(&config);
        for dir_bits in 0..8 {
            index.put(fp(0, dir_bits, 1), dir_bits + 1).unwrap();
        }
        // All eight pages cycled through two slots.
        for dir_bits in 0..8 {
            assert_eq!(index.get(fp(0, dir_bits, 1)).unwrap(), Some(dir_bits + 1));
        }
    }

    #[test]
    fn test_checkpoint_and_load() {
        let config = small_config();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");

        let file = PageFile::open(&path, config.page_size, true).unwrap();
        let mut index = HashIndex::create(file, &config).unwrap();
        for payload in 1..=120 {
            index.upsert(fp(0, 0, payload), payload).unwrap();
        }
        index.delete(fp(0, 0, 5)).unwrap();
        let depth = index.global_depth();
        index.checkpoint().unwrap();
        index.close().unwrap();
        drop(index);

        let file = PageFile::open(&path, config.page_size, false).unwrap();
        let mut index = HashIndex::load(file, &config).unwrap();
        assert_eq!(index.global_depth(), depth);
        assert_eq!(index.get(fp(0, 0, 5)).unwrap(), None);
        for payload in (1..=120).filter(|&p| p != 5) {
            assert_eq!(index.get(fp(0, 0, payload)).unwrap(), Some(payload));
        }
        index.check_invariants();
    }

    #[test]
    fn test_load_rejects_page_size_mismatch() {
        let config = small_config();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");

        let file = PageFile::open(&path, config.page_size, true).unwrap();
        let mut index = HashIndex::create(file, &config).unwrap();
        index.put(fp(0, 0, 1), 0x1000).unwrap();
        index.checkpoint().unwrap();
        index.close().unwrap();
        drop(index);

        let other = Config {
            page_size: 8192,
            ..config
        };
        let file = PageFile::open(&path, other.page_size, false).unwrap();
        assert!(matches!(
            HashIndex::load(file, &other),
            Err(KvError::LoadMismatch { stored: 4096, .. })
        ));
    }
}
