//! Host file abstraction: fixed-size (4096 B) page I/O over a single
//! backing store, plus an in-memory implementation used for deterministic
//! crash-injection tests.
//!
//! Corresponds to spec §6 "Host file API required by the core" (component A
//! in the system overview table).

#[cfg(test)]
mod tests;

use common::{CoreError, DbResult, Interval, PageIndex, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Page-granular I/O required by the cache, B-tree, and file store.
///
/// Implementors need not be thread-safe: the core assumes a single
/// controlling thread per open filesystem handle (spec §5).
pub trait HostFile {
    /// Extends the file by `n` pages and returns the newly allocated
    /// interval. The new pages' on-disk contents are unspecified.
    fn new_interval(&mut self, n: u32) -> DbResult<Interval>;

    /// Reads `dst.len()` bytes from page `id` starting at `offset`.
    fn read_page(&mut self, id: PageIndex, offset: usize, dst: &mut [u8]) -> DbResult<()>;

    /// Writes `src` into page `id` starting at `offset`.
    fn write_page(&mut self, id: PageIndex, offset: usize, src: &[u8]) -> DbResult<()>;

    /// Bulk-reads a contiguous interval of whole pages into `dst`, which
    /// must be exactly `iv.length() * PAGE_SIZE` bytes.
    fn read_pages(&mut self, iv: Interval, dst: &mut [u8]) -> DbResult<()>;

    /// Bulk-writes a contiguous interval of whole pages from `src`, which
    /// must be exactly `iv.length() * PAGE_SIZE` bytes.
    fn write_pages(&mut self, iv: Interval, src: &[u8]) -> DbResult<()>;

    /// Current size of the host file, in whole pages.
    fn file_size_in_pages(&mut self) -> DbResult<u64>;

    /// Requests a durability barrier for everything written so far.
    fn flush(&mut self) -> DbResult<()>;

    /// Truncates the file to exactly `pages` pages.
    fn truncate(&mut self, pages: u64) -> DbResult<()>;

    /// Convenience: reads one whole page.
    fn read_page_full(&mut self, id: PageIndex) -> DbResult<[u8; PAGE_SIZE]> {
        let mut buf = [0u8; PAGE_SIZE];
        self.read_page(id, 0, &mut buf)?;
        Ok(buf)
    }

    /// Convenience: writes one whole page.
    fn write_page_full(&mut self, id: PageIndex, page: &[u8; PAGE_SIZE]) -> DbResult<()> {
        self.write_page(id, 0, page)
    }

    /// Convenience: copies the on-disk contents of `from` to `to`.
    fn copy_page(&mut self, from: PageIndex, to: PageIndex) -> DbResult<()> {
        let buf = self.read_page_full(from)?;
        self.write_page_full(to, &buf)
    }
}

/// A `HostFile` backed by a real file on disk, opened for read+write.
#[derive(Debug)]
pub struct PosixHostFile {
    file: File,
}

impl PosixHostFile {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Exposes the raw file descriptor, needed by `locks` to place
    /// byte-range advisory locks on this same file.
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl HostFile for PosixHostFile {
    fn new_interval(&mut self, n: u32) -> DbResult<Interval> {
        let cur_pages = self.file_size_in_pages()?;
        let begin = cur_pages as u32;
        let end = begin + n;
        self.file.set_len(end as u64 * PAGE_SIZE as u64)?;
        Ok(Interval::new(begin, end))
    }

    fn read_page(&mut self, id: PageIndex, offset: usize, dst: &mut [u8]) -> DbResult<()> {
        let pos = id as u64 * PAGE_SIZE as u64 + offset as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    fn write_page(&mut self, id: PageIndex, offset: usize, src: &[u8]) -> DbResult<()> {
        let pos = id as u64 * PAGE_SIZE as u64 + offset as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(src)?;
        Ok(())
    }

    fn read_pages(&mut self, iv: Interval, dst: &mut [u8]) -> DbResult<()> {
        debug_assert_eq!(dst.len(), iv.length() as usize * PAGE_SIZE);
        self.file
            .seek(SeekFrom::Start(iv.begin() as u64 * PAGE_SIZE as u64))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    fn write_pages(&mut self, iv: Interval, src: &[u8]) -> DbResult<()> {
        debug_assert_eq!(src.len(), iv.length() as usize * PAGE_SIZE);
        self.file
            .seek(SeekFrom::Start(iv.begin() as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(src)?;
        Ok(())
    }

    fn file_size_in_pages(&mut self) -> DbResult<u64> {
        let len = self.file.metadata()?.len();
        Ok(len / PAGE_SIZE as u64)
    }

    fn flush(&mut self) -> DbResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, pages: u64) -> DbResult<()> {
        tracing::trace!(pages, "truncating host file");
        self.file.set_len(pages * PAGE_SIZE as u64)?;
        Ok(())
    }
}

/// An in-memory `HostFile`, supplemented from
/// `original_source/CompoundFs/MemoryFile.h` / `TempFile.h`: pure
/// test-tooling that makes crash-injection deterministic (no real fsync
/// cost, trivial to truncate and inspect mid-transaction).
#[derive(Debug, Default)]
pub struct MemHostFile {
    pages: Vec<[u8; PAGE_SIZE]>,
    /// If `Some(n)`, the n-th remaining write-like call fails with an I/O
    /// error instead of succeeding; used to simulate a crash mid-commit.
    fail_after: Option<usize>,
}

impl MemHostFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranges for the `n`-th subsequent mutating call (`new_interval`,
    /// `write_page`, `write_pages`, `flush`, `truncate`) to fail.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    fn tick(&mut self) -> DbResult<()> {
        if let Some(n) = self.fail_after {
            if n == 0 {
                self.fail_after = None;
                tracing::warn!("injected I/O failure fired");
                return Err(CoreError::Io(std::io::Error::other(
                    "injected I/O failure",
                )));
            }
            self.fail_after = Some(n - 1);
        }
        Ok(())
    }
}

impl HostFile for MemHostFile {
    fn new_interval(&mut self, n: u32) -> DbResult<Interval> {
        self.tick()?;
        let begin = self.pages.len() as u32;
        for _ in 0..n {
            self.pages.push([0u8; PAGE_SIZE]);
        }
        Ok(Interval::new(begin, begin + n))
    }

    fn read_page(&mut self, id: PageIndex, offset: usize, dst: &mut [u8]) -> DbResult<()> {
        let page = self
            .pages
            .get(id as usize)
            .ok_or_else(|| CoreError::Io(std::io::Error::other("read past end of file")))?;
        dst.copy_from_slice(&page[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_page(&mut self, id: PageIndex, offset: usize, src: &[u8]) -> DbResult<()> {
        self.tick()?;
        let page = self
            .pages
            .get_mut(id as usize)
            .ok_or_else(|| CoreError::Io(std::io::Error::other("write past end of file")))?;
        page[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read_pages(&mut self, iv: Interval, dst: &mut [u8]) -> DbResult<()> {
        for (i, page_id) in (iv.begin()..iv.end()).enumerate() {
            let dst_slice = &mut dst[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            self.read_page(page_id, 0, dst_slice)?;
        }
        Ok(())
    }

    fn write_pages(&mut self, iv: Interval, src: &[u8]) -> DbResult<()> {
        self.tick()?;
        for (i, page_id) in (iv.begin()..iv.end()).enumerate() {
            let src_slice = &src[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            let page = self
                .pages
                .get_mut(page_id as usize)
                .ok_or_else(|| CoreError::Io(std::io::Error::other("write past end of file")))?;
            page.copy_from_slice(src_slice);
        }
        Ok(())
    }

    fn file_size_in_pages(&mut self) -> DbResult<u64> {
        Ok(self.pages.len() as u64)
    }

    fn flush(&mut self) -> DbResult<()> {
        self.tick()
    }

    fn truncate(&mut self, pages: u64) -> DbResult<()> {
        self.tick()?;
        self.pages.truncate(pages as usize);
        self.pages.resize(pages as usize, [0u8; PAGE_SIZE]);
        Ok(())
    }
}
