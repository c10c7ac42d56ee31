//! Page-aligned file access
//!
//! `PageFile` wraps a file handle with positioned reads and writes plus
//! scoped memory mappings. Mappings are handed out as owning regions whose
//! `Drop` releases them, so eviction happens on every exit path.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::common::Result;

/// A file accessed at page granularity.
pub struct PageFile {
    file: File,
    path: PathBuf,
    page_size: u64,
}

impl PageFile {
    /// Open (creating if needed) the file at `path`. With `truncate` the
    /// file is reset to zero length, which is how a fresh store starts.
    pub fn open<P: AsRef<Path>>(path: P, page_size: u64, truncate: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if truncate {
            options.truncate(true);
        }
        let file = options.open(&path)?;
        Ok(Self {
            file,
            path,
            page_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Round `offset` down to the containing page boundary.
    pub fn align_down(&self, offset: u64) -> u64 {
        offset & !(self.page_size - 1)
    }

    /// Round `len` up to a whole number of pages.
    pub fn align_len(&self, len: u64) -> u64 {
        ((len - 1) | (self.page_size - 1)) + 1
    }

    /// Map `len` bytes starting at the page-aligned `offset` for writing,
    /// extending the file first if the span reaches past its end.
    pub fn load(&self, offset: u64, len: u64) -> Result<MappedRegion> {
        debug_assert_eq!(offset % self.page_size, 0);
        debug_assert_eq!(len % self.page_size, 0);
        self.ensure_len(offset + len)?;
        // The mapping stays valid because the file is never shrunk while
        // regions are outstanding.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map_mut(&self.file)?
        };
        Ok(MappedRegion { mmap, offset })
    }

    /// Map `len` bytes starting at the page-aligned `offset` for reading.
    pub fn load_ro(&self, offset: u64, len: u64) -> Result<ReadRegion> {
        debug_assert_eq!(offset % self.page_size, 0);
        self.ensure_len(offset + len)?;
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(&self.file)?
        };
        Ok(ReadRegion { mmap, offset })
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Force written data down to the device.
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn ensure_len(&self, required: u64) -> Result<()> {
        if self.len()? < required {
            self.file.set_len(required)?;
        }
        Ok(())
    }
}

/// A writable mapping of a file region. `flush` persists it; dropping the
/// region releases the mapping.
pub struct MappedRegion {
    mmap: MmapMut,
    offset: u64,
}

impl MappedRegion {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Synchronously write the mapped region back to the file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// A read-only mapping of a file region, released on drop.
pub struct ReadRegion {
    mmap: Mmap,
    offset: u64,
}

impl ReadRegion {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}
