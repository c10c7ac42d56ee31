//! Read-only mapped-page cache
//!
//! Bounded LRU of read-only file mappings keyed by page-aligned offset. The
//! log uses it for cold reads of records that have dropped below the
//! circular window. A cached span that turns out too short for its record is
//! evicted and re-mapped at the larger size; a single request larger than
//! the whole capacity is admitted anyway, overshooting the budget for just
//! that entry.

use std::collections::{HashMap, VecDeque};

use crate::common::Result;
use crate::file::{PageFile, ReadRegion};

struct CacheEntry {
    num_pages: u64,
    region: ReadRegion,
}

/// LRU cache of read-only mapped spans.
pub struct ReadCache {
    page_size: u64,
    capacity_pages: u64,
    mapped_pages: u64,
    entries: HashMap<u64, CacheEntry>,
    // Front is most recently used.
    lru: VecDeque<u64>,
}

impl ReadCache {
    pub fn new(capacity_pages: u64, page_size: u64) -> Self {
        Self {
            page_size,
            capacity_pages,
            mapped_pages: 0,
            entries: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn pages_required(&self, addr: u64, size: u64) -> u64 {
        if size == 0 {
            return 1;
        }
        let aligned = addr & !(self.page_size - 1);
        (size + addr - aligned - 1) / self.page_size + 1
    }

    fn promote(&mut self, aligned: u64) {
        if let Some(pos) = self.lru.iter().position(|&off| off == aligned) {
            self.lru.remove(pos);
        }
        self.lru.push_front(aligned);
    }

    fn evict(&mut self, aligned: u64) {
        if let Some(entry) = self.entries.remove(&aligned) {
            self.mapped_pages -= entry.num_pages;
        }
        if let Some(pos) = self.lru.iter().position(|&off| off == aligned) {
            self.lru.remove(pos);
        }
    }

    /// Return the bytes from `addr` to the end of the mapped span covering
    /// `[addr, addr + size)`, mapping it in (and evicting as needed) first.
    pub fn get(&mut self, file: &PageFile, addr: u64, size: u64) -> Result<&[u8]> {
        let aligned = addr & !(self.page_size - 1);
        let num_pages = self.pages_required(addr, size);

        let resident = self.entries.get(&aligned).map(|entry| entry.num_pages);
        match resident {
            Some(pages) if pages >= num_pages => {
                self.promote(aligned);
            }
            Some(_) => {
                // Present but too short for this record; remap larger.
                self.evict(aligned);
                self.load(file, aligned, num_pages)?;
            }
            None => {
                self.load(file, aligned, num_pages)?;
            }
        }

        let entry = &self.entries[&aligned];
        Ok(&entry.region.bytes()[(addr - aligned) as usize..])
    }

    fn load(&mut self, file: &PageFile, aligned: u64, num_pages: u64) -> Result<()> {
        while self.mapped_pages + num_pages > self.capacity_pages {
            // A request beyond the whole capacity is still admitted once the
            // cache is empty.
            if self.mapped_pages == 0 {
                break;
            }
            let victim = match self.lru.pop_back() {
                Some(off) => off,
                None => break,
            };
            if let Some(entry) = self.entries.remove(&victim) {
                self.mapped_pages -= entry.num_pages;
            }
        }

        let region = file.load_ro(aligned, num_pages * self.page_size)?;
        self.mapped_pages += num_pages;
        self.entries.insert(aligned, CacheEntry { num_pages, region });
        self.lru.push_front(aligned);
        Ok(())
    }

    /// Release every mapping.
    pub fn close(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.mapped_pages = 0;
    }

    #[cfg(test)]
    fn resident_pages(&self) -> u64 {
        self.mapped_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PS: u64 = 4096;

    fn fixture(pages: u64) -> (TempDir, PageFile) {
        let dir = TempDir::new().unwrap();
        let file = PageFile::open(dir.path().join("log.bin"), PS, true).unwrap();
        let mut data = vec![0u8; (pages * PS) as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i / PS as usize) as u8;
        }
        file.write_all_at(&data, 0).unwrap();
        (dir, file)
    }

    #[test]
    fn test_hit_returns_page_bytes() {
        let (_dir, file) = fixture(4);
        let mut cache = ReadCache::new(8, PS);

        let bytes = cache.get(&file, PS + 10, 4).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(cache.resident_pages(), 1);

        // Second access is a hit; nothing new mapped.
        let _ = cache.get(&file, PS, 4).unwrap();
        assert_eq!(cache.resident_pages(), 1);
    }

    #[test]
    fn test_short_entry_is_remapped_larger() {
        let (_dir, file) = fixture(4);
        let mut cache = ReadCache::new(8, PS);

        let bytes = cache.get(&file, 0, 16).unwrap();
        assert_eq!(bytes.len(), PS as usize);

        // Same offset, but the record spans into the next page.
        let bytes = cache.get(&file, 0, PS + 100).unwrap();
        assert_eq!(bytes.len(), 2 * PS as usize);
        assert_eq!(cache.resident_pages(), 2);
    }

    #[test]
    fn test_lru_eviction_order() {
        let (_dir, file) = fixture(4);
        let mut cache = ReadCache::new(2, PS);

        cache.get(&file, 0, 8).unwrap();
        cache.get(&file, PS, 8).unwrap();
        // Touch page 0 so page 1 is the LRU tail.
        cache.get(&file, 0, 8).unwrap();
        cache.get(&file, 2 * PS, 8).unwrap();

        assert_eq!(cache.resident_pages(), 2);
        assert!(cache.entries.contains_key(&0));
        assert!(!cache.entries.contains_key(&PS));
        assert!(cache.entries.contains_key(&(2 * PS)));
    }

    #[test]
    fn test_oversized_request_overshoots_capacity() {
        let (_dir, file) = fixture(4);
        let mut cache = ReadCache::new(2, PS);

        cache.get(&file, 0, 8).unwrap();
        let bytes = cache.get(&file, PS, 3 * PS).unwrap();
        assert_eq!(bytes.len(), 3 * PS as usize);
        // The old resident was evicted, the big span is in alone.
        assert_eq!(cache.resident_pages(), 3);
    }

    #[test]
    fn test_close_releases_everything() {
        let (_dir, file) = fixture(4);
        let mut cache = ReadCache::new(8, PS);
        cache.get(&file, 0, 8).unwrap();
        cache.get(&file, PS, 8).unwrap();

        cache.close();
        assert_eq!(cache.resident_pages(), 0);
        assert!(cache.entries.is_empty());
    }
}
