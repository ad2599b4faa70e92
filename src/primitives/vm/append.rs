use std::fmt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};

use super::{check_page_bits, page_index, page_offset, PagedMemory};
use crate::primitives::io::{FileHandle, SharedFilesFacade};
use crate::types::{Result, StoreError};

/// Append-only writer over a column file that keeps exactly one page mapped.
///
/// Bytes are written at `base_offset + append_pointer`. When the hot page is
/// full the next append releases it, grows the file to cover the following
/// page and maps that one instead. `close` truncates the file to the logical
/// size, so a closed file never carries page-rounding slack.
pub struct AppendMemory {
    ff: SharedFilesFacade,
    fh: Option<FileHandle>,
    path: PathBuf,
    bits: u32,
    page: u64,
    map: Option<MmapMut>,
    append_pointer: usize,
    page_hi: usize,
    base_offset: u64,
}

impl AppendMemory {
    /// Opens `path` for appending at logical offset `size`.
    pub fn open(ff: SharedFilesFacade, path: impl AsRef<Path>, bits: u32, size: u64) -> Result<Self> {
        check_page_bits(bits)?;
        let path = path.as_ref().to_path_buf();
        let fh = ff.open_rw(&path)?;
        let page = page_index(size, bits);
        let map = map_file_page(&ff, &fh, bits, page)?;
        let base_offset = page_offset(page, bits);
        let mem = Self {
            ff,
            fh: Some(fh),
            path,
            bits,
            page,
            map: Some(map),
            append_pointer: (size - base_offset) as usize,
            page_hi: 1usize << bits,
            base_offset,
        };
        mem.check_invariants();
        debug!(
            path = %mem.path.display(),
            bits,
            size,
            page,
            "vm.append.open"
        );
        Ok(mem)
    }

    /// Logical number of bytes written so far.
    pub fn size(&self) -> u64 {
        self.base_offset + self.append_pointer as u64
    }

    /// Free bytes left in the hot page.
    pub fn remaining_in_page(&self) -> usize {
        self.page_hi - self.append_pointer
    }

    /// Index of the hot page.
    pub fn current_page(&self) -> u64 {
        self.page
    }

    /// Number of pages currently mapped (0 or 1).
    pub fn mapped_pages(&self) -> usize {
        usize::from(self.map.is_some())
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `close` already ran.
    pub fn is_closed(&self) -> bool {
        self.fh.is_none()
    }

    /// Appends raw bytes, rolling over pages as needed.
    pub fn append_bytes(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            if self.append_pointer == self.page_hi {
                self.allocate_next_page()?;
            }
            let n = src.len().min(self.page_hi - self.append_pointer);
            let at = self.append_pointer;
            let page = self.hot_page_mut()?;
            page[at..at + n].copy_from_slice(&src[..n]);
            self.append_pointer += n;
            src = &src[n..];
        }
        Ok(())
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.append_bytes(&[value])
    }

    /// Appends a boolean as a single byte.
    pub fn put_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(u8::from(value))
    }

    /// Appends a little-endian `i16`.
    pub fn put_i16(&mut self, value: i16) -> Result<()> {
        self.append_bytes(&value.to_le_bytes())
    }

    /// Appends a little-endian `i32`.
    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.append_bytes(&value.to_le_bytes())
    }

    /// Appends a little-endian `i64`.
    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.append_bytes(&value.to_le_bytes())
    }

    /// Appends a little-endian `f64`.
    pub fn put_f64(&mut self, value: f64) -> Result<()> {
        self.append_bytes(&value.to_le_bytes())
    }

    /// Discards everything: the file shrinks to one page and the cursor resets to zero.
    pub fn truncate(&mut self) -> Result<()> {
        self.release_page()?;
        let page_size = self.page_size() as u64;
        {
            let fh = self.handle()?;
            self.ff.truncate(fh, page_size)?;
        }
        self.page = 0;
        self.base_offset = 0;
        self.append_pointer = 0;
        self.map = Some(self.map_page(0)?);
        self.check_invariants();
        debug!(path = %self.path.display(), "vm.append.truncate");
        Ok(())
    }

    /// Flushes the hot page and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(map) = self.map.as_ref() {
            map.flush()
                .map_err(|err| StoreError::storage_io("msync", &self.path, err))?;
        }
        let fh = self.handle()?;
        self.ff.fsync(fh)
    }

    /// Unmaps the hot page and truncates the file to the logical size.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        let Some(fh) = self.fh.take() else {
            return Ok(());
        };
        let size = self.size();
        let unmapped = match self.map.take() {
            Some(map) => self.ff.unmap(&fh, map),
            None => Ok(()),
        };
        let truncated = self.ff.truncate(&fh, size);
        debug!(path = %self.path.display(), size, "vm.append.close");
        unmapped.and(truncated)
    }

    fn handle(&self) -> Result<&FileHandle> {
        self.fh.as_ref().ok_or(StoreError::Closed("append memory"))
    }

    fn hot_page_mut(&mut self) -> Result<&mut [u8]> {
        if self.fh.is_none() {
            return Err(StoreError::Closed("append memory"));
        }
        if self.map.is_none() {
            self.map = Some(self.map_page(self.page)?);
        }
        match self.map.as_mut() {
            Some(map) => Ok(&mut map[..]),
            None => Err(StoreError::Closed("append memory")),
        }
    }

    fn map_page(&self, page: u64) -> Result<MmapMut> {
        map_file_page(&self.ff, self.handle()?, self.bits, page)
    }

    fn check_invariants(&self) {
        debug_assert!(self.append_pointer <= self.page_hi);
        debug_assert_eq!(self.page_hi, self.page_size());
        debug_assert_eq!(self.base_offset, page_offset(self.page, self.bits));
    }
}

/// Grows the file to cover `page` and maps it.
fn map_file_page(ff: &SharedFilesFacade, fh: &FileHandle, bits: u32, page: u64) -> Result<MmapMut> {
    let target = page_offset(page + 1, bits);
    if ff.length(fh)? < target {
        ff.truncate(fh, target)?;
    }
    ff.map_rw(fh, page_offset(page, bits), 1usize << bits)
}

impl PagedMemory for AppendMemory {
    fn page_size(&self) -> usize {
        1usize << self.bits
    }

    fn allocate_next_page(&mut self) -> Result<()> {
        self.release_page()?;
        let next = self.page + 1;
        let map = self.map_page(next)?;
        self.map = Some(map);
        self.page = next;
        self.base_offset = page_offset(next, self.bits);
        self.append_pointer = 0;
        self.check_invariants();
        debug!(path = %self.path.display(), page = next, "vm.append.rollover");
        Ok(())
    }

    fn release_page(&mut self) -> Result<()> {
        match (self.map.take(), self.fh.as_ref()) {
            (Some(map), Some(fh)) => self.ff.unmap(fh, map),
            _ => Ok(()),
        }
    }

    fn page_address(&self, page: u32) -> Option<&[u8]> {
        if u64::from(page) != self.page {
            return None;
        }
        self.map.as_ref().map(|map| &map[..])
    }
}

impl Drop for AppendMemory {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), error = %err, "vm.append.close_on_drop_failed");
        }
    }
}

impl fmt::Debug for AppendMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendMemory")
            .field("path", &self.path)
            .field("bits", &self.bits)
            .field("page", &self.page)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}
