//! Fixed pool of mapped index pages
//!
//! A bounded set of slots, each holding a writable mapping of one hash page,
//! ordered by an intrusive LRU list. Loading into a full pool evicts the
//! tail slot, flushing it first when dirty, and reports the evicted owner so
//! the directory can drop its page reference.

use crate::common::Result;
use crate::file::{MappedRegion, PageFile};

const NIL: usize = usize::MAX;

struct Slot {
    dir_idx: u32,
    dirty: bool,
    region: Option<MappedRegion>,
    prev: usize,
    next: usize,
}

/// Pool of in-memory index pages with LRU replacement.
pub struct PagePool {
    slots: Vec<Slot>,
    used: usize,
    head: usize,
    tail: usize,
}

impl PagePool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                dir_idx: 0,
                dirty: false,
                region: None,
                prev: NIL,
                next: NIL,
            });
        }
        Self {
            slots,
            used: 0,
            head: NIL,
            tail: NIL,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Promote a slot to the front of the LRU order.
    pub fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    pub fn mark_dirty(&mut self, idx: usize) {
        self.slots[idx].dirty = true;
    }

    pub fn page(&self, idx: usize) -> &[u8] {
        self.slots[idx].region.as_ref().unwrap().bytes()
    }

    pub fn page_mut(&mut self, idx: usize) -> &mut [u8] {
        self.slots[idx].region.as_mut().unwrap().bytes_mut()
    }

    /// Map the page at `offset` into a slot and return `(slot, evicted
    /// owner)`. The evicted owner is the directory index whose page was
    /// displaced, if the pool was full.
    pub fn acquire(
        &mut self,
        file: &PageFile,
        offset: u64,
        dir_idx: u32,
        page_size: u64,
    ) -> Result<(usize, Option<u32>)> {
        let (idx, evicted) = if self.used < self.slots.len() {
            let idx = self.used;
            self.used += 1;
            (idx, None)
        } else {
            let idx = self.tail;
            debug_assert_ne!(idx, NIL);
            self.unlink(idx);
            let slot = &mut self.slots[idx];
            let owner = slot.dir_idx;
            if slot.dirty {
                slot.region.as_ref().unwrap().flush()?;
                slot.dirty = false;
            }
            slot.region = None;
            (idx, Some(owner))
        };

        let region = file.load(offset, page_size)?;
        let slot = &mut self.slots[idx];
        slot.region = Some(region);
        slot.dir_idx = dir_idx;
        slot.dirty = false;
        self.push_front(idx);
        Ok((idx, evicted))
    }

    /// Flush every dirty resident page.
    pub fn flush_all(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            if slot.dirty {
                if let Some(region) = slot.region.as_ref() {
                    region.flush()?;
                }
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush the LRU tail page if it is dirty. Returns whether any work was
    /// done.
    pub fn flush_lru_dirty(&mut self) -> Result<bool> {
        if self.tail == NIL {
            return Ok(false);
        }
        let slot = &mut self.slots[self.tail];
        if !slot.dirty {
            return Ok(false);
        }
        slot.region.as_ref().unwrap().flush()?;
        slot.dirty = false;
        Ok(true)
    }

    /// Flush dirty pages and release every mapping.
    pub fn close(&mut self) -> Result<()> {
        self.flush_all()?;
        for slot in &mut self.slots {
            slot.region = None;
        }
        self.used = 0;
        self.head = NIL;
        self.tail = NIL;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PS: u64 = 4096;

    fn fixture() -> (TempDir, PageFile) {
        let dir = TempDir::new().unwrap();
        let file = PageFile::open(dir.path().join("index.bin"), PS, true).unwrap();
        (dir, file)
    }

    #[test]
    fn test_acquire_fills_slots_before_evicting() {
        let (_dir, file) = fixture();
        let mut pool = PagePool::new(2);

        let (s0, ev0) = pool.acquire(&file, 0, 10, PS).unwrap();
        let (s1, ev1) = pool.acquire(&file, PS, 11, PS).unwrap();
        assert_eq!((s0, s1), (0, 1));
        assert!(ev0.is_none() && ev1.is_none());

        // Pool full: the LRU tail (slot 0, owner 10) gets displaced.
        let (s2, ev2) = pool.acquire(&file, 2 * PS, 12, PS).unwrap();
        assert_eq!(s2, 0);
        assert_eq!(ev2, Some(10));
    }

    #[test]
    fn test_touch_changes_eviction_victim() {
        let (_dir, file) = fixture();
        let mut pool = PagePool::new(2);

        let (s0, _) = pool.acquire(&file, 0, 10, PS).unwrap();
        let (_s1, _) = pool.acquire(&file, PS, 11, PS).unwrap();
        pool.touch(s0);

        let (_s2, evicted) = pool.acquire(&file, 2 * PS, 12, PS).unwrap();
        assert_eq!(evicted, Some(11));
    }

    #[test]
    fn test_eviction_flushes_dirty_page() {
        let (_dir, file) = fixture();
        let mut pool = PagePool::new(1);

        let (slot, _) = pool.acquire(&file, 0, 0, PS).unwrap();
        pool.page_mut(slot)[0..4].copy_from_slice(b"dirt");
        pool.mark_dirty(slot);

        pool.acquire(&file, PS, 1, PS).unwrap();

        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"dirt");
    }

    #[test]
    fn test_flush_lru_dirty() {
        let (_dir, file) = fixture();
        let mut pool = PagePool::new(2);

        let (s0, _) = pool.acquire(&file, 0, 0, PS).unwrap();
        pool.acquire(&file, PS, 1, PS).unwrap();
        assert!(!pool.flush_lru_dirty().unwrap());

        pool.page_mut(s0)[0] = 0xEE;
        pool.mark_dirty(s0);
        // Slot 0 is the tail (slot 1 was acquired later).
        assert!(pool.flush_lru_dirty().unwrap());
        assert!(!pool.flush_lru_dirty().unwrap());

        let mut buf = [0u8; 1];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 0xEE);
    }

    #[test]
    fn test_close_persists_and_releases() {
        let (_dir, file) = fixture();
        let mut pool = PagePool::new(2);

        let (slot, _) = pool.acquire(&file, 0, 0, PS).unwrap();
        pool.page_mut(slot)[0] = 0x7F;
        pool.mark_dirty(slot);
        pool.close().unwrap();

        let mut buf = [0u8; 1];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x7F);
    }
}
