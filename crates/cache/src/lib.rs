//! Page cache and commit/rollback/recovery handler (spec §4.1, §4.6).
//!
//! Grounded on `original_source/CompoundFs/Cache.h`, `CommitHandler.{h,cpp}`,
//! and `RollbackHandler.{h,cpp}`. The cache mediates every page I/O for the
//! higher layers (B-tree, file store, free store): it classifies pages by
//! mutation state, evicts under memory pressure without breaking the
//! "original disk image unchanged until commit" invariant, and drives the
//! write-ahead log that makes commit crash-safe.
//!
//! One deliberate divergence from the original: `entries` and `diverted` are
//! always keyed by a page's *original* id, never re-keyed to a diverted copy
//! id. The original's `CacheManager`/`Cache` re-inserts a reloaded diverted
//! page into its cache map under the copy's id, which means a page evicted
//! a second time updates `m_redirectedPagesMap` keyed by that copy id —
//! `redirectPage` only follows one hop, so a lookup by the true original id
//! still resolves to the now-stale first copy. Keying by the original id
//! throughout makes that bug impossible by construction: `diverted` can
//! only ever hold a single, always-current entry per original id.

#[cfg(test)]
mod tests;

mod log_page;

pub use log_page::{LogPage, PageCopy, MAX_ENTRIES};

use common::{seal_page, verify_page, CoreError, DbResult, PageIndex, PAGE_SIZE};
use hostfile::HostFile;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// A page buffer shared between the cache and whichever client currently
/// holds a handle to it. `Rc::strong_count > 1` is how the cache recognizes
/// a page as pinned (spec §4.1, eviction policy).
pub type PageBuffer = Rc<RefCell<[u8; PAGE_SIZE]>>;

/// Mutation state of a cached page (spec §4.1 "Page classes").
///
/// Declaration order doubles as eviction-keep priority: `derive(Ord)` ranks
/// `New > Dirty > Read`, so sorting entries descending by `(class, ...)`
/// keeps `New` pages resident longest and evicts `Read` pages first,
/// matching the spec's explicit "prefer evicting Read over Dirty over New".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageClass {
    Read,
    Dirty,
    New,
}

#[derive(Debug)]
struct CachedEntry {
    buffer: PageBuffer,
    class: PageClass,
    usage_count: u64,
    /// Vestigial tie-breaker carried over from the original's `m_priority`
    /// bitfield; nothing in this port ever sets it away from `0`.
    priority: u8,
}

/// Result of [`PageCache::dirty_page_ids`]/[`PageCache::has_new_page_work`]
/// telling the caller which commit path applies.
#[derive(Debug)]
pub enum CommitPlan {
    /// No dirty work and no outstanding new pages: commit is a lock-free
    /// no-op apart from releasing the write lock.
    NoOp,
    /// No dirty originals, but new pages are outstanding: commit only needs
    /// the commit lock briefly to publish them; no log is required because
    /// new pages are strictly appended past the pre-transaction end of file.
    NewPagesOnly,
    /// At least one dirty original exists: the full copy/log/publish/
    /// truncate protocol is required.
    NeedsLog { dirty_ids: Vec<PageIndex> },
}

/// Opaque state threaded between [`PageCache::commit_prelude`],
/// [`PageCache::commit_publish`], and [`PageCache::commit_finish`]. Kept
/// separate so the caller (the `engine` crate) controls exactly when the
/// commit lock is held: only across `commit_publish`.
#[derive(Debug)]
pub struct CommitPrelude {
    pre_commit_size: u64,
    copy_pairs: Vec<PageCopy>,
}

/// In-memory page cache plus the commit/rollback/recovery state machine
/// described in spec §4.1.
#[derive(Debug)]
pub struct PageCache<H: HostFile> {
    host: H,
    entries: HashMap<PageIndex, CachedEntry>,
    diverted: HashMap<PageIndex, PageIndex>,
    new_page_ids: HashSet<PageIndex>,
    max_cached_pages: usize,
}

impl<H: HostFile> PageCache<H> {
    pub fn new(host: H, max_cached_pages: usize) -> Self {
        Self {
            host,
            entries: HashMap::new(),
            diverted: HashMap::new(),
            new_page_ids: HashSet::new(),
            max_cached_pages,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Consumes the cache and recovers the underlying host file, discarding
    /// any still-cached pages. Used by callers that want to close a session
    /// and reopen the same backing store (tests against `MemHostFile`, which
    /// has no path to reopen by).
    pub fn into_host(self) -> H {
        self.host
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extends the file by one page and presents a fresh zeroed buffer for
    /// it, classed `New`.
    pub fn new_page(&mut self) -> DbResult<(PageBuffer, PageIndex)> {
        let id = self.host.new_interval(1)?.begin();
        let buffer = Rc::new(RefCell::new([0u8; PAGE_SIZE]));
        self.entries.insert(
            id,
            CachedEntry { buffer: buffer.clone(), class: PageClass::New, usage_count: 0, priority: 0 },
        );
        self.new_page_ids.insert(id);
        self.maybe_trim()?;
        Ok((buffer, id))
    }

    /// Presents a fresh buffer for `id` without touching disk, classed
    /// `New`. Used by the free store when it converts a page it knows to be
    /// currently unused (taken from its own free list) into a fresh
    /// FileTable page — the page's stale disk contents are never read.
    pub fn repurpose(&mut self, id: PageIndex) -> DbResult<PageBuffer> {
        let buffer = Rc::new(RefCell::new([0u8; PAGE_SIZE]));
        self.entries.insert(
            id,
            CachedEntry { buffer: buffer.clone(), class: PageClass::New, usage_count: 0, priority: 0 },
        );
        self.new_page_ids.insert(id);
        self.maybe_trim()?;
        Ok(buffer)
    }

    /// Resolves `id` through the cache, then the diversion map, then disk.
    /// Returns a read-only-by-convention shared buffer: callers that intend
    /// to mutate it must go through [`PageCache::make_writable`] first.
    pub fn load_page(&mut self, id: PageIndex) -> DbResult<PageBuffer> {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.usage_count += 1;
            return Ok(entry.buffer.clone());
        }

        let real_id = self.diverted.get(&id).copied().unwrap_or(id);
        let raw = self.host.read_page_full(real_id)?;
        if !verify_page(&raw) {
            return Err(CoreError::ChecksumMismatch(real_id));
        }
        let buffer = Rc::new(RefCell::new(raw));
        self.entries.insert(
            id,
            CachedEntry { buffer: buffer.clone(), class: PageClass::Read, usage_count: 0, priority: 0 },
        );
        self.maybe_trim()?;
        Ok(buffer)
    }

    /// Promotes `id` to `Dirty` if it is currently `Read` (a `New` page
    /// stays `New`). Loads the page first if it is not already resident.
    pub fn make_writable(&mut self, id: PageIndex) -> DbResult<PageBuffer> {
        let buffer = self.load_page(id)?;
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.class == PageClass::Read {
                entry.class = PageClass::Dirty;
            }
        }
        Ok(buffer)
    }

    /// Best-effort shrink to at most `target` entries, per the spec §4.1
    /// eviction policy. Pages whose buffer a client still holds (`Rc`
    /// strong count > 1) are never evicted.
    pub fn trim(&mut self, target: usize) -> DbResult<()> {
        let mut candidates: Vec<(PageIndex, PageClass, u64, u8)> = self
            .entries
            .iter()
            .filter(|(_, e)| Rc::strong_count(&e.buffer) == 1)
            .map(|(id, e)| (*id, e.class, e.usage_count, e.priority))
            .collect();
        if candidates.len() <= target {
            return Ok(());
        }
        tracing::debug!(current = candidates.len(), target, "trimming page cache");

        candidates.sort_by(|a, b| (b.1, b.2, b.3).cmp(&(a.1, a.2, a.3)));

        for (id, class, _, _) in candidates.into_iter().skip(target) {
            match class {
                PageClass::Read => {
                    tracing::trace!(page = id, "evicting clean page");
                    self.entries.remove(&id);
                }
                PageClass::New => {
                    tracing::trace!(page = id, "evicting new page, writing through");
                    let entry = self.entries.remove(&id).expect("candidate came from entries");
                    let mut buf = *entry.buffer.borrow();
                    seal_page(&mut buf);
                    self.host.write_page_full(id, &buf)?;
                    self.new_page_ids.insert(id);
                }
                PageClass::Dirty => {
                    let entry = self.entries.remove(&id).expect("candidate came from entries");
                    let copy_id = self.host.new_interval(1)?.begin();
                    tracing::trace!(page = id, copy = copy_id, "evicting dirty page, diverting to copy");
                    let mut buf = *entry.buffer.borrow();
                    seal_page(&mut buf);
                    self.host.write_page_full(copy_id, &buf)?;
                    self.diverted.insert(id, copy_id);
                }
            }
        }
        Ok(())
    }

    fn maybe_trim(&mut self) -> DbResult<()> {
        if self.entries.len() > self.max_cached_pages {
            self.trim(self.max_cached_pages * 3 / 4)?;
        }
        Ok(())
    }

    /// Original ids of every currently-dirty page: the union of the
    /// diversion map's keys and any still-cached `Dirty` entries.
    pub fn dirty_page_ids(&self) -> Vec<PageIndex> {
        let mut ids: Vec<PageIndex> = self.diverted.keys().copied().collect();
        for (id, entry) in &self.entries {
            if entry.class == PageClass::Dirty {
                ids.push(*id);
            }
        }
        ids
    }

    pub fn has_new_page_work(&self) -> bool {
        !self.new_page_ids.is_empty()
    }

    /// Decides which of the three commit paths applies (spec §4.1 "Commit
    /// protocol", steps 1-3).
    pub fn plan_commit(&self) -> CommitPlan {
        let dirty_ids = self.dirty_page_ids();
        if dirty_ids.is_empty() {
            if self.has_new_page_work() {
                CommitPlan::NewPagesOnly
            } else {
                CommitPlan::NoOp
            }
        } else {
            CommitPlan::NeedsLog { dirty_ids }
        }
    }

    /// Pre-lock phase of a logged commit: snapshots the pre-commit file
    /// size, copies every dirty original to a fresh end-of-file slot,
    /// flushes, writes log pages recording the `(orig, copy)` pairs, and
    /// flushes again. This is the linearization point for crash recovery —
    /// once a log page is durable, a crash can be recovered from.
    pub fn commit_prelude(&mut self, dirty_ids: &[PageIndex]) -> DbResult<CommitPrelude> {
        tracing::debug!(dirty = dirty_ids.len(), "commit phase: prelude (copy + log)");
        let pre_commit_size = self.host.file_size_in_pages()?;

        let interval = self.host.new_interval(dirty_ids.len() as u32)?;
        let mut copy_pairs = Vec::with_capacity(dirty_ids.len());
        let mut next = interval.begin();
        for &original in dirty_ids {
            self.host.copy_page(original, next)?;
            copy_pairs.push(PageCopy { original, copy: next });
            next += 1;
        }
        self.host.flush()?;

        self.write_logs(&copy_pairs)?;
        self.host.flush()?;

        Ok(CommitPrelude { pre_commit_size, copy_pairs })
    }

    fn write_logs(&mut self, pairs: &[PageCopy]) -> DbResult<()> {
        let mut remaining = pairs;
        while !remaining.is_empty() {
            let page_index = self.host.new_interval(1)?.begin();
            let mut log = LogPage::new();
            remaining = log.push_back(remaining);
            let buf = log.encode(page_index);
            self.host.write_page_full(page_index, &buf)?;
        }
        Ok(())
    }

    /// The exclusively-locked phase: publish every dirty original's final
    /// content to its own slot, then publish any still-cached `New` pages.
    /// The caller must hold the commit lock across this call and release it
    /// immediately afterward — *before* [`PageCache::commit_finish`].
    pub fn commit_publish(&mut self, prelude: &CommitPrelude) -> DbResult<()> {
        tracing::debug!(pages = prelude.copy_pairs.len(), "commit phase: publish (under lock)");
        for pair in &prelude.copy_pairs {
            if let Some(entry) = self.entries.remove(&pair.original) {
                let mut buf = *entry.buffer.borrow();
                seal_page(&mut buf);
                self.host.write_page_full(pair.original, &buf)?;
            } else {
                let diverted_copy = self
                    .diverted
                    .remove(&pair.original)
                    .expect("a dirty page not in cache must be diverted");
                self.host.copy_page(diverted_copy, pair.original)?;
            }
        }
        self.diverted.clear();
        self.write_remaining_cached_pages()
    }

    /// Writes every still-cached non-`Read` page to its own id, then drops
    /// the entire cache. Used both as the tail of a logged commit and as
    /// the whole body of the unlogged new-pages-only commit path.
    fn write_remaining_cached_pages(&mut self) -> DbResult<()> {
        let ids: Vec<PageIndex> = self
            .entries
            .iter()
            .filter(|(_, e)| e.class != PageClass::Read)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let entry = self.entries.remove(&id).expect("id came from entries");
            let mut buf = *entry.buffer.borrow();
            seal_page(&mut buf);
            self.host.write_page_full(id, &buf)?;
        }
        self.entries.clear();
        self.new_page_ids.clear();
        Ok(())
    }

    /// Unlogged commit path: under the commit lock, write outstanding new
    /// pages and drop the cache. No flush/truncate follows — there is
    /// nothing appended past the logical end of file to erase.
    pub fn commit_new_pages_only(&mut self) -> DbResult<()> {
        self.write_remaining_cached_pages()
    }

    /// Tail of a logged commit: flush, then truncate away every copy and
    /// log page appended during `commit_prelude`. This single truncate is
    /// what makes the commit durable — a crash any time before it completes
    /// is indistinguishable from "commit never happened" to recovery.
    pub fn commit_finish(&mut self, prelude: CommitPrelude) -> DbResult<()> {
        tracing::debug!(pre_commit_size = prelude.pre_commit_size, "commit phase: finish (truncate)");
        self.host.flush()?;
        self.host.truncate(prelude.pre_commit_size)?;
        Ok(())
    }

    /// Discards the cache, diversion map, and new-page set, then truncates
    /// the file back to `composite_size` (the size recorded by the last
    /// successful commit).
    pub fn rollback(&mut self, composite_size: u64) -> DbResult<()> {
        self.entries.clear();
        self.new_page_ids.clear();
        self.diverted.clear();
        self.host.truncate(composite_size)?;
        Ok(())
    }

    /// Scans the file backward one page at a time, accepting only pages
    /// whose signature matches their own index, and returns the union of
    /// every log page's `(orig, copy)` pairs. Stops at the first page that
    /// fails the signature test — necessarily a committed data page.
    pub fn scan_log_pages(&mut self) -> DbResult<Vec<PageCopy>> {
        let mut size = self.host.file_size_in_pages()?;
        let mut pairs = Vec::new();
        while size > 0 {
            let idx = (size - 1) as PageIndex;
            let buf = self.host.read_page_full(idx)?;
            match LogPage::decode(&buf, idx) {
                Some(log) => {
                    pairs.extend_from_slice(log.entries());
                    size -= 1;
                }
                None => break,
            }
        }
        Ok(pairs)
    }

    /// Physical recovery (read-write open): copies every recovered `copy ->
    /// orig` pair back over the original, restoring pre-commit content. The
    /// caller follows with [`PageCache::rollback`] to truncate away the
    /// copies and log pages themselves.
    pub fn recover_physical(&mut self) -> DbResult<()> {
        let pairs = self.scan_log_pages()?;
        if !pairs.is_empty() {
            tracing::warn!(pages = pairs.len(), "recovering from an incomplete commit (physical)");
        }
        for pair in &pairs {
            self.host.copy_page(pair.copy, pair.original)?;
        }
        self.host.flush()?;
        Ok(())
    }

    /// Virtual recovery (read-only open): seeds the diversion map so this
    /// session reads the pre-commit view without mutating the file.
    pub fn recover_virtual(&mut self) -> DbResult<()> {
        let pairs = self.scan_log_pages()?;
        if !pairs.is_empty() {
            tracing::warn!(pages = pairs.len(), "recovering from an incomplete commit (virtual, read-only)");
        }
        for pair in pairs {
            self.diverted.insert(pair.original, pair.copy);
        }
        Ok(())
    }
}
