//! Shared primitives for the transactional virtual filesystem core: page
//! addressing, interval arithmetic, the error taxonomy, and runtime
//! configuration.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed size of every page in the host file, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of page payload covered by the trailing checksum (`PAGE_SIZE - 4`).
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - 4;

/// Maximum length, in bytes, of a B-tree key or value.
pub const MAX_ENTRY_LEN: usize = 255;

/// Sentinel `PageIndex` meaning "no page".
pub const INVALID_PAGE: PageIndex = u32::MAX;

/// 32-bit identifier of a page in the host file.
///
/// Examples:
/// - `let root = PageIndex::new(0);`
/// - `let none = PageIndex::INVALID;`
pub type PageIndex = u32;

/// Extension helpers for `PageIndex` (a plain `u32` alias, so these live as
/// free functions / a small trait rather than inherent methods).
pub trait PageIndexExt: Sized {
    const INVALID: Self;
    fn is_valid(self) -> bool;
}

impl PageIndexExt for PageIndex {
    const INVALID: Self = INVALID_PAGE;
    fn is_valid(self) -> bool {
        self != INVALID_PAGE
    }
}

/// Half-open `[begin, end)` range of page indices.
///
/// Examples:
/// - `Interval::new(4, 9).length() == 5`
/// - `Interval::single(4).length() == 1`
/// - `Interval::new(4, 4).empty()`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    begin: PageIndex,
    end: PageIndex,
}

impl Interval {
    pub fn new(begin: PageIndex, end: PageIndex) -> Self {
        assert!(begin <= end, "interval begin must not exceed end");
        Self { begin, end }
    }

    pub fn single(begin: PageIndex) -> Self {
        Self {
            begin,
            end: begin + 1,
        }
    }

    pub fn empty() -> Self {
        Self {
            begin: INVALID_PAGE,
            end: INVALID_PAGE,
        }
    }

    pub fn begin(&self) -> PageIndex {
        self.begin
    }

    pub fn end(&self) -> PageIndex {
        self.end
    }

    pub fn length(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::empty()
    }
}

/// Ordered sequence of `Interval`s that merges adjacent ranges on insertion.
///
/// Mirrors `CompoundFs::IntervalSequence`: a deque of intervals with
/// `push_back` coalescing, `pop_front(n)` for partial consumption, and a
/// `sort` pass that also coalesces after reordering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntervalSequence {
    intervals: VecDeque<Interval>,
    total_length: u64,
}

impl IntervalSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, iv: Interval) {
        assert!(!iv.is_empty());
        self.total_length += iv.length() as u64;
        match self.intervals.back_mut() {
            Some(back) if back.end() == iv.begin() => back.end = iv.end(),
            _ => self.intervals.push_back(iv),
        }
    }

    pub fn front(&self) -> Option<Interval> {
        self.intervals.front().copied()
    }

    pub fn back(&self) -> Option<Interval> {
        self.intervals.back().copied()
    }

    pub fn front_length(&self) -> u32 {
        self.front().map(|iv| iv.length()).unwrap_or(0)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn pop_front(&mut self) -> Option<Interval> {
        let iv = self.intervals.pop_front()?;
        self.total_length -= iv.length() as u64;
        Some(iv)
    }

    /// Takes up to `max_size` pages from the head interval, splitting it if
    /// necessary, and returns the taken range. Returns `None` if empty.
    pub fn pop_front_n(&mut self, max_size: u32) -> Option<Interval> {
        let front = self.intervals.front_mut()?;
        let id = front.begin();
        let size = max_size.min(front.length());
        front.begin += size;
        let taken = Interval::new(id, id + size);
        if front.is_empty() {
            self.intervals.pop_front();
        }
        self.total_length -= size as u64;
        Some(taken)
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
        self.total_length = 0;
    }

    /// Sorts intervals by `(begin, end)` then coalesces adjacent ranges.
    pub fn sort(&mut self) {
        let mut v: Vec<_> = self.intervals.drain(..).collect();
        v.sort();
        let mut merged: Vec<Interval> = Vec::with_capacity(v.len());
        for iv in v {
            match merged.last_mut() {
                Some(last) if last.end() == iv.begin() => last.end = iv.end(),
                _ => merged.push(iv),
            }
        }
        self.intervals = merged.into();
    }

    /// Moves all intervals into `other`, preserving merge semantics, and
    /// clears `self`.
    pub fn move_to(&mut self, other: &mut IntervalSequence) {
        for iv in self.intervals.drain(..) {
            other.push_back(iv);
        }
        self.total_length = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }
}

/// Recoverable error taxonomy shared across the core's crates.
///
/// Per the two-channel error model in spec §7/§9: most variants are
/// ordinary recoverable failures, but `ChecksumMismatch`/`CorruptPage` are
/// the "invariant violation" class — fatal for the current transaction, the
/// caller should close the session rather than retry.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch at page {0}")]
    ChecksumMismatch(PageIndex),
    #[error("corrupt page {0}: {1}")]
    CorruptPage(PageIndex, String),
    #[error("key or value exceeds {MAX_ENTRY_LEN} bytes")]
    OversizeEntry,
    #[error("operation on closed handle")]
    HandleClosed,
    #[error("lock not acquired")]
    LockNotAcquired,
    #[error("host file exhausted page space")]
    OutOfPages,
    #[error("cursor refers to a page that is no longer live")]
    StaleCursor,
}

/// Result alias carrying a `CoreError`.
pub type DbResult<T> = Result<T, CoreError>;

/// Computes the CRC32C-style checksum (via `crc32fast`) over the first
/// `PAGE_PAYLOAD_SIZE` bytes of a page buffer.
pub fn page_checksum(page: &[u8; PAGE_SIZE]) -> u32 {
    crc32fast::hash(&page[..PAGE_PAYLOAD_SIZE])
}

/// Writes the trailing checksum of a page buffer in place.
pub fn seal_page(page: &mut [u8; PAGE_SIZE]) {
    let sum = page_checksum(page);
    page[PAGE_PAYLOAD_SIZE..].copy_from_slice(&sum.to_le_bytes());
}

/// Verifies the trailing checksum of a page buffer.
pub fn verify_page(page: &[u8; PAGE_SIZE]) -> bool {
    let stored = u32::from_le_bytes(page[PAGE_PAYLOAD_SIZE..].try_into().unwrap());
    let computed = page_checksum(page);
    let ok = stored == computed;
    if !ok {
        tracing::warn!(stored, computed, "page checksum mismatch");
    }
    ok
}

/// Runtime configuration for the engine and its subsystems.
///
/// # Example
/// ```
/// use common::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .max_cached_pages(512)
///     .fsync_on_commit(false)
///     .build();
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct EngineConfig {
    /// Number of pages the cache keeps resident before trimming.
    #[builder(default = 256)]
    pub max_cached_pages: usize,
    /// In-memory interval count at which a stream writer flushes into
    /// FileTable pages (spec §4.3, "high-water mark").
    #[builder(default = 250_000)]
    pub file_table_flush_watermark: usize,
    /// Whether commits request a durability barrier (`fsync`) at each flush
    /// point. Disabling this is only safe for throwaway/in-memory hosts.
    #[builder(default = true)]
    pub fsync_on_commit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cached_pages: 256,
            file_table_flush_watermark: 250_000,
            fsync_on_commit: true,
        }
    }
}
