//! Flush coordination between the foreground writer and the flusher
//!
//! The two sides share a pending-page count and an in-progress flag under
//! one mutex, a condition variable signalled in both directions (work
//! arrived; a batch completed), and a monotonically advancing persist
//! watermark. Pages wholly below the watermark are durable. Batches are
//! drained in FIFO order and never include the page currently under write,
//! because requests only ever advance past page boundaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::Result;
use crate::file::PageFile;
use crate::log::window::Window;

struct FlushState {
    pending_pages: u64,
    in_progress: bool,
}

/// State shared between the foreground and the flusher thread.
pub struct FlushShared {
    state: Mutex<FlushState>,
    work_cv: Condvar,
    /// Next log address to flush; always page-aligned. Everything below is
    /// durable in the file.
    persist_addr: AtomicU64,
    window: Arc<Window>,
    file: Arc<PageFile>,
}

impl FlushShared {
    pub fn new(window: Arc<Window>, file: Arc<PageFile>, persist_addr: u64) -> Self {
        Self {
            state: Mutex::new(FlushState {
                pending_pages: 0,
                in_progress: false,
            }),
            work_cv: Condvar::new(),
            persist_addr: AtomicU64::new(persist_addr),
            window,
            file,
        }
    }

    pub fn persist_addr(&self) -> u64 {
        self.persist_addr.load(Ordering::Acquire)
    }

    /// Reset the watermark. Only valid with no pending work and no flush in
    /// flight (load, or window reset after outrunning its content).
    pub fn reset_persist_addr(&self, addr: u64) {
        debug_assert_eq!(self.state.lock().pending_pages, 0);
        self.persist_addr.store(addr, Ordering::Release);
    }

    /// Queue `pages` more whole pages for flushing and wake the flusher.
    pub fn request(&self, pages: u64) {
        {
            let mut state = self.state.lock();
            state.pending_pages += pages;
        }
        self.work_cv.notify_one();
    }

    /// Attempt one flush batch right now. `Ok(false)` means no work.
    pub fn try_flush(&self) -> Result<bool> {
        let state = self.state.lock();
        self.flush_batch(state)
    }

    /// Timed wait for pending work, then drain one batch. Used by the
    /// flusher thread.
    pub fn background_flush(&self, timeout: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.pending_pages == 0 {
            let _ = self.work_cv.wait_for(&mut state, timeout);
        }
        if state.pending_pages > 0 || state.in_progress {
            self.flush_batch(state)
        } else {
            Ok(false)
        }
    }

    /// Flush until the queue is empty. Used by checkpoint.
    pub fn drain(&self) -> Result<()> {
        while self.try_flush()? {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Drain one batch: claim up to the pending count, bounded by the pages
    /// left before the buffer wraps, write it out unlocked, then advance
    /// the watermark.
    fn flush_batch(&self, mut state: MutexGuard<'_, FlushState>) -> Result<bool> {
        if state.in_progress {
            // Another caller is mid-batch; report work so callers re-check.
            return Ok(true);
        }
        if state.pending_pages == 0 {
            return Ok(false);
        }
        state.in_progress = true;
        let page_size = self.window.page_size();
        let persist = self.persist_addr.load(Ordering::Acquire);
        let slot = self.window.slot_of(persist);
        let batch = state.pending_pages.min(self.window.pages() - slot);
        state.pending_pages -= batch;
        drop(state);

        // The claimed pages sit strictly below the request frontier, which
        // the foreground never rewrites before the watermark passes them.
        let buf = unsafe { self.window.page_run(slot, batch) };
        let result = self
            .file
            .write_all_at(buf, persist)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = &result {
            log::error!("flush of {batch} pages at address {persist} failed: {e}");
        }

        // Advance even on error so the foreground cannot wedge on the
        // watermark; the error surfaces to the caller.
        self.persist_addr
            .store(persist + batch * page_size, Ordering::Release);
        self.state.lock().in_progress = false;
        self.work_cv.notify_all();
        result.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PS: u64 = 4096;

    fn fixture(pages: u64) -> (TempDir, Arc<PageFile>, Arc<Window>) {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(PageFile::open(dir.path().join("log.bin"), PS, true).unwrap());
        let window = Arc::new(Window::new(pages, PS).unwrap());
        (dir, file, window)
    }

    #[test]
    fn test_no_work_reports_false() {
        let (_dir, file, window) = fixture(4);
        let shared = FlushShared::new(window, file, PS);
        assert!(!shared.try_flush().unwrap());
        assert!(
            !shared
                .background_flush(Duration::from_micros(6))
                .unwrap()
        );
        assert_eq!(shared.persist_addr(), PS);
    }

    #[test]
    fn test_flush_writes_requested_pages() {
        let (_dir, file, window) = fixture(4);
        unsafe {
            window.slice_mut(PS, 4).copy_from_slice(b"page");
        }
        let shared = FlushShared::new(window, file.clone(), PS);

        shared.request(1);
        assert!(shared.try_flush().unwrap());
        assert_eq!(shared.persist_addr(), 2 * PS);

        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, PS).unwrap();
        assert_eq!(&buf, b"page");
    }

    #[test]
    fn test_batch_stops_at_wrap() {
        let (_dir, file, window) = fixture(4);
        // Addresses 2*PS..6*PS occupy slots 2, 3, 0, 1: two batches.
        for page in 2..6u64 {
            unsafe {
                window
                    .slice_mut(window.offset_of(page * PS), 1)
                    .copy_from_slice(&[page as u8]);
            }
        }
        let shared = FlushShared::new(window, file.clone(), 2 * PS);

        shared.request(4);
        assert!(shared.try_flush().unwrap());
        assert_eq!(shared.persist_addr(), 4 * PS);
        assert!(shared.try_flush().unwrap());
        assert_eq!(shared.persist_addr(), 6 * PS);
        assert!(!shared.try_flush().unwrap());

        for page in 2..6u64 {
            let mut buf = [0u8; 1];
            file.read_exact_at(&mut buf, page * PS).unwrap();
            assert_eq!(buf[0], page as u8);
        }
    }

    #[test]
    fn test_drain_empties_queue() {
        let (_dir, file, window) = fixture(4);
        let shared = FlushShared::new(window, file, PS);
        shared.request(3);
        shared.drain().unwrap();
        assert_eq!(shared.persist_addr(), 4 * PS);
        assert!(!shared.try_flush().unwrap());
    }

    #[test]
    fn test_background_flush_wakes_on_request() {
        let (_dir, file, window) = fixture(4);
        let shared = Arc::new(FlushShared::new(window, file, PS));

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let mut flushed = false;
                for _ in 0..200_000 {
                    if shared.background_flush(Duration::from_micros(6)).unwrap() {
                        flushed = true;
                        break;
                    }
                }
                flushed
            })
        };

        shared.request(2);
        assert!(worker.join().unwrap());
        shared.drain().unwrap();
        assert_eq!(shared.persist_addr(), 3 * PS);
    }
}
