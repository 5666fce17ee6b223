//! Extent-based file streams (spec §4.3): a `Writer`/`Reader` pair that
//! store a byte stream as a chain of page extents described by
//! [`file_table::FileTable`] pages, addressed end to end by a
//! [`FileDescriptor`].
//!
//! Grounded on `original_source/CompoundFs`'s `FileWriter`/`FileReader`:
//! writes top up a partially-filled tail page, then allocate whole pages
//! for the bulk, then a final page for the remainder; reads mirror that
//! shape. One simplification from the original: bulk allocation here goes
//! through `cache::PageCache::new_page` one page at a time rather than a
//! dedicated multi-page allocator — consecutive calls during a normal
//! append still yield ascending ids, and `common::IntervalSequence`
//! coalesces those into a single interval on push, so the on-disk shape
//! this produces is the same; a true contiguous pre-allocation would be a
//! `freestore`-level concern layered on top by the engine.

pub mod file_table;

use cache::{PageBuffer, PageCache};
use common::{DbResult, Interval, PageIndex, PageIndexExt, PAGE_SIZE};
use file_table::{take_page_worth, FileTable};
use hostfile::HostFile;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Persisted handle to a stream: the first and last FileTable page in its
/// chain, plus the exact byte length (so the final, partially-filled page
/// doesn't need a separate "valid bytes" marker).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub first: PageIndex,
    pub last: PageIndex,
    pub size_bytes: u64,
}

impl FileDescriptor {
    /// The descriptor of a stream that has never been written to.
    pub fn empty() -> Self {
        Self { first: PageIndex::INVALID, last: PageIndex::INVALID, size_bytes: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self::empty()
    }
}

/// Appends bytes to a stream, producing a new [`FileDescriptor`] on
/// [`Writer::close`].
///
/// Holds the tail FileTable's already-recorded intervals in memory so a
/// freshly-appended extent can coalesce with the stream's previous last
/// extent, and flushes them out to pages either once `watermark` entries
/// have piled up or at `close`.
pub struct Writer<H: HostFile> {
    cache: Rc<RefCell<PageCache<H>>>,
    first_table: PageIndex,
    last_table: PageIndex,
    reusable_table: PageIndex,
    pending: VecDeque<Interval>,
    tail_page: PageIndex,
    tail_used: usize,
    size_bytes: u64,
    watermark: usize,
}

impl<H: HostFile> Writer<H> {
    /// Loads the tail FileTable of `fd` (a fresh descriptor yields an
    /// empty writer) so appended bytes can continue its final extent.
    pub fn open_append(
        cache: Rc<RefCell<PageCache<H>>>,
        fd: &FileDescriptor,
        watermark: usize,
    ) -> DbResult<Self> {
        let mut pending = VecDeque::new();
        if fd.last.is_valid() {
            let buf = cache.borrow_mut().load_page(fd.last)?;
            let raw = *buf.borrow();
            let table = FileTable::decode(&raw, fd.last)?;
            pending = table.intervals.into();
        }

        let tail_used = if fd.size_bytes == 0 {
            0
        } else {
            let rem = (fd.size_bytes % PAGE_SIZE as u64) as usize;
            if rem == 0 {
                PAGE_SIZE
            } else {
                rem
            }
        };
        let tail_page = if fd.size_bytes == 0 {
            PageIndex::INVALID
        } else {
            pending.back().map(|iv| iv.end() - 1).unwrap_or(PageIndex::INVALID)
        };

        Ok(Self {
            cache,
            first_table: fd.first,
            last_table: fd.last,
            reusable_table: fd.last,
            pending,
            tail_page,
            tail_used,
            size_bytes: fd.size_bytes,
            watermark,
        })
    }

    fn push_interval(&mut self, iv: Interval) {
        match self.pending.back_mut() {
            Some(last) if last.end() == iv.begin() => *last = Interval::new(last.begin(), iv.end()),
            _ => self.pending.push_back(iv),
        }
    }

    /// Writes `bytes` to the stream: tops up a partial tail page, bulk
    /// allocates whole pages, then allocates one final page for the
    /// remainder.
    pub fn write(&mut self, bytes: &[u8]) -> DbResult<()> {
        let mut remaining = bytes;

        if self.tail_page.is_valid() && self.tail_used > 0 && self.tail_used < PAGE_SIZE && !remaining.is_empty() {
            let room = PAGE_SIZE - self.tail_used;
            let take = room.min(remaining.len());
            let buf = self.cache.borrow_mut().make_writable(self.tail_page)?;
            buf.borrow_mut()[self.tail_used..self.tail_used + take].copy_from_slice(&remaining[..take]);
            self.tail_used += take;
            self.size_bytes += take as u64;
            remaining = &remaining[take..];
        }

        let whole_pages = remaining.len() / PAGE_SIZE;
        for _ in 0..whole_pages {
            let (buf, id) = self.cache.borrow_mut().new_page()?;
            buf.borrow_mut()[..PAGE_SIZE].copy_from_slice(&remaining[..PAGE_SIZE]);
            remaining = &remaining[PAGE_SIZE..];
            self.push_interval(Interval::single(id));
            self.tail_page = id;
            self.tail_used = PAGE_SIZE;
            self.size_bytes += PAGE_SIZE as u64;
        }

        if !remaining.is_empty() {
            let (buf, id) = self.cache.borrow_mut().new_page()?;
            buf.borrow_mut()[..remaining.len()].copy_from_slice(remaining);
            self.push_interval(Interval::single(id));
            self.tail_page = id;
            self.tail_used = remaining.len();
            self.size_bytes += remaining.len() as u64;
        }

        if self.pending.len() >= self.watermark {
            self.flush()?;
        }
        Ok(())
    }

    /// Packs every pending extent into FileTable pages, chaining them in
    /// order and reusing the old tail table's page id for the first chunk
    /// when one is available, so re-flushing never orphans a page.
    fn flush(&mut self) -> DbResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(pending = self.pending.len(), "flushing pending extents into FileTable pages");
        let prior_tail = self.last_table;

        let mut chunks = Vec::new();
        while !self.pending.is_empty() {
            let chunk = take_page_worth(&mut self.pending);
            assert!(!chunk.is_empty(), "a single extent must always fit one page");
            chunks.push(chunk);
        }

        let mut pages: Vec<(PageIndex, PageBuffer)> = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            let pair = if self.reusable_table.is_valid() {
                let id = self.reusable_table;
                self.reusable_table = PageIndex::INVALID;
                let buf = self.cache.borrow_mut().repurpose(id)?;
                (id, buf)
            } else {
                self.cache.borrow_mut().new_page()?
            };
            pages.push(pair);
        }

        for (i, chunk) in chunks.into_iter().enumerate() {
            let next = if i + 1 < pages.len() { pages[i + 1].0 } else { PageIndex::INVALID };
            let table = FileTable { next, intervals: chunk };
            *pages[i].1.borrow_mut() = table.encode();
        }

        // `reusable_table` absorbs the previous tail's content into pages[0]
        // when it applies; otherwise a chain already exists from an earlier
        // flush this session and its `next` pointer must now be patched to
        // reach this batch.
        if prior_tail.is_valid() && prior_tail != pages[0].0 {
            let buf = self.cache.borrow_mut().make_writable(prior_tail)?;
            let raw = *buf.borrow();
            let mut table = FileTable::decode(&raw, prior_tail)?;
            table.next = pages[0].0;
            *buf.borrow_mut() = table.encode();
        }

        if !self.first_table.is_valid() {
            self.first_table = pages[0].0;
        }
        self.last_table = pages.last().unwrap().0;
        Ok(())
    }

    /// Flushes any pending extents and returns the stream's new descriptor.
    pub fn close(mut self) -> DbResult<FileDescriptor> {
        self.flush()?;
        Ok(FileDescriptor { first: self.first_table, last: self.last_table, size_bytes: self.size_bytes })
    }
}

/// Reads a stream sequentially from a [`FileDescriptor`].
pub struct Reader<H: HostFile> {
    cache: Rc<RefCell<PageCache<H>>>,
    next_table: PageIndex,
    queue: VecDeque<Interval>,
    current_page: Option<(PageIndex, usize)>,
    size_bytes: u64,
    position: u64,
}

impl<H: HostFile> Reader<H> {
    pub fn open(cache: Rc<RefCell<PageCache<H>>>, fd: &FileDescriptor) -> DbResult<Self> {
        let mut queue = VecDeque::new();
        let mut next_table = PageIndex::INVALID;
        if fd.first.is_valid() {
            let buf = cache.borrow_mut().load_page(fd.first)?;
            let raw = *buf.borrow();
            let table = FileTable::decode(&raw, fd.first)?;
            next_table = table.next;
            queue = table.intervals.into();
        }
        Ok(Self { cache, next_table, queue, current_page: None, size_bytes: fd.size_bytes, position: 0 })
    }

    pub fn bytes_left(&self) -> u64 {
        self.size_bytes - self.position
    }

    fn next_page_id(&mut self) -> DbResult<Option<PageIndex>> {
        loop {
            if let Some(front) = self.queue.front_mut() {
                let id = front.begin();
                if front.length() == 1 {
                    self.queue.pop_front();
                } else {
                    *front = Interval::new(front.begin() + 1, front.end());
                }
                return Ok(Some(id));
            }
            if !self.next_table.is_valid() {
                return Ok(None);
            }
            let buf = self.cache.borrow_mut().load_page(self.next_table)?;
            let raw = *buf.borrow();
            let table = FileTable::decode(&raw, self.next_table)?;
            self.next_table = table.next;
            self.queue = table.intervals.into();
        }
    }

    /// Fills `out` with up to `out.len()` bytes, stopping early at the end
    /// of the stream; reads never run past `size_bytes`. Returns the
    /// number of bytes actually read.
    pub fn read(&mut self, out: &mut [u8]) -> DbResult<usize> {
        let want = (out.len() as u64).min(self.bytes_left()) as usize;
        let mut filled = 0;

        while filled < want {
            if self.current_page.is_none() {
                match self.next_page_id()? {
                    Some(id) => self.current_page = Some((id, 0)),
                    None => break,
                }
            }
            let (id, offset) = self.current_page.unwrap();
            let page = self.cache.borrow_mut().load_page(id)?;
            let page_ref = page.borrow();
            let take = (PAGE_SIZE - offset).min(want - filled);
            out[filled..filled + take].copy_from_slice(&page_ref[offset..offset + take]);
            drop(page_ref);
            filled += take;
            let new_offset = offset + take;
            self.current_page = if new_offset >= PAGE_SIZE { None } else { Some((id, new_offset)) };
        }

        self.position += filled as u64;
        Ok(filled)
    }
}
