//! Circular log window buffer
//!
//! A single page-aligned allocation of `pages` page slots. The slot for log
//! address `a` is `(a / page_size) % pages`, so the window holds any run of
//! at most `pages` consecutive log pages without a separate head counter.
//!
//! The buffer is shared between the foreground writer and the flusher
//! thread. The accessors are unsafe because the compiler cannot see the
//! protocol that keeps them disjoint: the foreground only writes at or
//! above the flush-request frontier, and the flusher only reads whole pages
//! strictly below it.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::common::{KvError, Result};

pub struct Window {
    ptr: NonNull<u8>,
    pages: u64,
    page_size: u64,
}

// Disjointness of reader and writer ranges is maintained by the flush
// protocol in `log::flush`.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    pub fn new(pages: u64, page_size: u64) -> Result<Self> {
        let len = (pages * page_size) as usize;
        let layout = Layout::from_size_align(len, page_size as usize)
            .map_err(|_| KvError::AllocationFailed { size: len })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(KvError::AllocationFailed { size: len })?;
        Ok(Self {
            ptr,
            pages,
            page_size,
        })
    }

    pub fn len(&self) -> u64 {
        self.pages * self.page_size
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Page slot holding the log address `addr`.
    pub fn slot_of(&self, addr: u64) -> u64 {
        (addr / self.page_size) % self.pages
    }

    /// Byte offset of `addr` within the buffer.
    pub fn offset_of(&self, addr: u64) -> u64 {
        self.slot_of(addr) * self.page_size + addr % self.page_size
    }

    /// Read `len` bytes starting at buffer offset `at`.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent writer touches the range,
    /// per the flush protocol described in the module docs.
    pub unsafe fn slice(&self, at: u64, len: u64) -> &[u8] {
        debug_assert!(at + len <= self.len());
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(at as usize), len as usize) }
    }

    /// Write access to `len` bytes starting at buffer offset `at`.
    ///
    /// # Safety
    /// The caller must be the sole writer and the range must be at or above
    /// the flush-request frontier.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, at: u64, len: u64) -> &mut [u8] {
        debug_assert!(at + len <= self.len());
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(at as usize), len as usize) }
    }

    /// Contiguous view of `count` page slots starting at `slot`.
    ///
    /// # Safety
    /// Same contract as [`Self::slice`]; `slot + count` must not exceed the
    /// buffer end.
    pub unsafe fn page_run(&self, slot: u64, count: u64) -> &[u8] {
        unsafe { self.slice(slot * self.page_size, count * self.page_size) }
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        let len = (self.pages * self.page_size) as usize;
        let layout = Layout::from_size_align(len, self.page_size as usize).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_zeroed_and_aligned() {
        let window = Window::new(4, 4096).unwrap();
        assert_eq!(window.len(), 4 * 4096);
        let bytes = unsafe { window.slice(0, window.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(bytes.as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn test_slot_mapping_wraps() {
        let window = Window::new(4, 4096).unwrap();
        assert_eq!(window.slot_of(4096), 1);
        assert_eq!(window.slot_of(4 * 4096), 0);
        assert_eq!(window.slot_of(5 * 4096 + 7), 1);
        assert_eq!(window.offset_of(5 * 4096 + 7), 4096 + 7);
    }

    #[test]
    fn test_write_read_round_trip() {
        let window = Window::new(2, 4096).unwrap();
        unsafe {
            window.slice_mut(100, 5).copy_from_slice(b"hello");
            assert_eq!(window.slice(100, 5), b"hello");
        }
    }
}
