//! Free page reclamation (spec §4.4): accepts pages and deleted streams
//! given up during a transaction and makes them available for allocation
//! in the *next* one.
//!
//! Grounded on `original_source/CompoundFs/FreeStore.{h,cpp}`. Reuses
//! `filestore`'s FileTable page format wholesale for its own persisted
//! extent list — a free store's "my available pages" table and a stream's
//! "my content extents" table are bit-identical, so `filestore::FileTable`
//! and `filestore::file_table::take_page_worth` are imported rather than
//! redefined.
//!
//! One simplification from the original: `close` always sources new
//! FileTable pages for the merged free list via `cache::PageCache::new_page`
//! rather than carving table pages out of the free pool being described
//! (the original's "self-hosting" trick). The spec explicitly allows
//! falling back to the cache allocator "when necessary"; doing so
//! unconditionally trades a small space optimization for a close() that is
//! obviously correct by construction rather than one that has to reason
//! about a table page excluding itself from its own free list.

#[cfg(test)]
mod tests;

use cache::{PageBuffer, PageCache};
use common::{DbResult, Interval, IntervalSequence, PageIndex, PageIndexExt};
use filestore::file_table::{take_page_worth, FileTable};
use filestore::FileDescriptor;
use hostfile::HostFile;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Accepts deallocated meta-data pages and deleted streams during a
/// transaction and hands out recycled pages to the *next* one.
///
/// Its own state is itself a [`FileDescriptor`]/[`FileTable`] chain,
/// persisted in the commit block by the caller.
pub struct FreeStore<H: HostFile> {
    cache: Rc<RefCell<PageCache<H>>>,
    descriptor: FileDescriptor,
    available: IntervalSequence,
    next_table: PageIndex,
    freed_meta_pages: Vec<PageIndex>,
    pending_deletions: Vec<FileDescriptor>,
    reclaimed_bytes: u64,
}

impl<H: HostFile> FreeStore<H> {
    /// Opens a free store against its own persisted descriptor. Nothing is
    /// eagerly loaded: the head FileTable is only read on first `allocate`.
    pub fn open(cache: Rc<RefCell<PageCache<H>>>, descriptor: FileDescriptor) -> Self {
        Self {
            cache,
            next_table: descriptor.first,
            descriptor,
            available: IntervalSequence::new(),
            freed_meta_pages: Vec::new(),
            pending_deletions: Vec::new(),
            reclaimed_bytes: 0,
        }
    }

    pub fn descriptor(&self) -> FileDescriptor {
        self.descriptor
    }

    pub fn reclaimed_bytes(&self) -> u64 {
        self.reclaimed_bytes
    }

    /// Loads the next not-yet-read FileTable in the chain into `available`.
    /// The table page itself becomes reclaimable, since its content is now
    /// fully absorbed into `available`.
    fn load_more(&mut self) -> DbResult<bool> {
        if !self.next_table.is_valid() {
            return Ok(false);
        }
        let id = self.next_table;
        let buf = self.cache.borrow_mut().load_page(id)?;
        let raw = *buf.borrow();
        let table = FileTable::decode(&raw, id)?;
        self.next_table = table.next;
        self.freed_meta_pages.push(id);
        for iv in table.intervals {
            self.available.push_back(iv);
        }
        self.available.sort();
        Ok(true)
    }

    /// Returns an interval of up to `n` contiguous pages. Loads additional
    /// FileTables from the chain while the head run is shorter than
    /// requested and the chain isn't exhausted. An empty interval means
    /// the free store has nothing left; the caller must grow the host
    /// file instead.
    pub fn allocate(&mut self, n: u32) -> DbResult<Interval> {
        while self.available.front_length() < n && self.next_table.is_valid() {
            self.load_more()?;
        }
        let iv = self.available.pop_front_n(n).unwrap_or_else(Interval::empty);
        if iv.is_empty() {
            tracing::trace!(requested = n, "free store exhausted, caller must grow the host file");
        }
        Ok(iv)
    }

    /// Marks a single meta-data page as free for the next transaction.
    pub fn deallocate(&mut self, page: PageIndex) {
        self.freed_meta_pages.push(page);
    }

    /// Stages a deleted stream's pages for reclamation at commit.
    pub fn delete(&mut self, fd: FileDescriptor) {
        if fd.first.is_valid() {
            self.pending_deletions.push(fd);
        }
    }

    fn patch_next(&mut self, page_id: PageIndex, next: PageIndex) -> DbResult<()> {
        let buf = self.cache.borrow_mut().make_writable(page_id)?;
        let raw = *buf.borrow();
        let mut table = FileTable::decode(&raw, page_id)?;
        table.next = next;
        *buf.borrow_mut() = table.encode();
        Ok(())
    }

    /// Commit-time finalize (spec §4.4 "Close"): folds every pending
    /// deletion and deallocation, plus whatever this transaction never
    /// handed out, into a fresh FileTable chain and returns the store's new
    /// descriptor. The caller persists this in the commit block.
    pub fn close(&mut self) -> DbResult<FileDescriptor> {
        tracing::debug!(
            pending_deletions = self.pending_deletions.len(),
            freed_meta_pages = self.freed_meta_pages.len(),
            "closing free store: rotating head table"
        );
        // pull in the rest of the previous chain so none of it is lost;
        // every table consumed this way is itself added to the free set.
        while self.load_more()? {}

        let mut freed_extents = IntervalSequence::new();
        let mut survivors: Vec<FileDescriptor> = Vec::new();

        for fd in std::mem::take(&mut self.pending_deletions) {
            self.reclaimed_bytes += fd.size_bytes;
            if !fd.first.is_valid() {
                continue;
            }
            if fd.first == fd.last {
                // one-page optimization: absorb the lone table's intervals
                // directly rather than keeping a near-empty table around.
                let buf = self.cache.borrow_mut().load_page(fd.first)?;
                let raw = *buf.borrow();
                let table = FileTable::decode(&raw, fd.first)?;
                for iv in table.intervals {
                    freed_extents.push_back(iv);
                }
                self.freed_meta_pages.push(fd.first);
            } else {
                survivors.push(fd);
            }
        }

        for id in std::mem::take(&mut self.freed_meta_pages) {
            freed_extents.push_back(Interval::single(id));
        }
        while !self.available.is_empty() {
            freed_extents.push_back(self.available.pop_front().unwrap());
        }
        freed_extents.sort();

        let mut remaining: VecDeque<Interval> = freed_extents.iter().copied().collect();
        let mut written: Vec<(PageIndex, PageBuffer)> = Vec::new();
        while !remaining.is_empty() {
            let chunk = take_page_worth(&mut remaining);
            let pair = self.cache.borrow_mut().new_page()?;
            let table = FileTable { next: PageIndex::INVALID, intervals: chunk };
            *pair.1.borrow_mut() = table.encode();
            written.push(pair);
        }
        for i in 0..written.len().saturating_sub(1) {
            let next = written[i + 1].0;
            self.patch_next(written[i].0, next)?;
        }

        let (mut chain_first, mut chain_last) = match written.first() {
            Some((id, _)) => (*id, written.last().unwrap().0),
            None => (PageIndex::INVALID, PageIndex::INVALID),
        };

        // surviving multi-table deleted files keep their own FileTable
        // chain verbatim (it's already in this exact format) and are just
        // spliced onto the tail.
        for survivor in survivors {
            if chain_first.is_valid() {
                self.patch_next(chain_last, survivor.first)?;
            } else {
                chain_first = survivor.first;
            }
            chain_last = survivor.last;
        }

        self.descriptor = FileDescriptor { first: chain_first, last: chain_last, size_bytes: self.reclaimed_bytes };
        Ok(self.descriptor)
    }
}
