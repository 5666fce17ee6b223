//! Write-ahead log page format (spec §4.6).
//!
//! Grounded on `original_source/CompoundFs/LogPage.h`: a log page
//! self-identifies via a signature derived from its own page index rather
//! than a global log header, so backward recovery scan can distinguish "one
//! more log page" from "the first committed data page" without any other
//! bookkeeping.

use common::{seal_page, verify_page, PageIndex, PAGE_SIZE};

/// Maximum `(original, copy)` pairs a single log page can hold. Chosen so
/// that `16 + 4 + 509 * 8 + 4 == 4096` exactly.
pub const MAX_ENTRIES: usize = 509;

const SIGNATURE_LEN: usize = 16;
const SIZE_OFFSET: usize = SIGNATURE_LEN;
const ENTRIES_OFFSET: usize = SIZE_OFFSET + 4;
const ENTRY_LEN: usize = 8;

/// A `std::minstd_rand`-compatible linear congruential generator: the
/// Park-Miller minimal standard, `state' = state * 48271 mod (2^31 - 1)`.
/// Reproduced exactly so a log page's signature matches the original
/// format bit-for-bit.
struct MinstdRand {
    state: u64,
}

impl MinstdRand {
    const A: u64 = 48271;
    const M: u64 = 2_147_483_647;

    /// Seeds the generator. A seed of `0` is remapped to `1`, matching
    /// `std::minstd_rand`'s behavior (the all-zero state is absorbing).
    fn new(seed: u32) -> Self {
        let seed = if seed == 0 { 1 } else { seed as u64 };
        Self { state: seed }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = (self.state * Self::A) % Self::M;
        self.state as u32
    }
}

fn signature_for(page_index: PageIndex) -> [u8; SIGNATURE_LEN] {
    let mut rng = MinstdRand::new(page_index);
    let mut out = [0u8; SIGNATURE_LEN];
    for chunk in out.chunks_exact_mut(4) {
        chunk.copy_from_slice(&rng.next_u32().to_le_bytes());
    }
    out
}

/// An `(original, copy)` page-index pair recorded by a commit in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageCopy {
    pub original: PageIndex,
    pub copy: PageIndex,
}

/// In-memory view of a log page: a signature, an entry count, and up to
/// [`MAX_ENTRIES`] `(original, copy)` pairs.
#[derive(Debug, Default)]
pub struct LogPage {
    entries: Vec<PageCopy>,
}

impl LogPage {
    pub fn new() -> Self {
        Self { entries: Vec::with_capacity(MAX_ENTRIES) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_ENTRIES
    }

    pub fn entries(&self) -> &[PageCopy] {
        &self.entries
    }

    /// Appends as many pairs from `src` as fit, returning the unconsumed
    /// remainder.
    pub fn push_back<'a>(&mut self, src: &'a [PageCopy]) -> &'a [PageCopy] {
        let room = MAX_ENTRIES - self.entries.len();
        let take = room.min(src.len());
        self.entries.extend_from_slice(&src[..take]);
        &src[take..]
    }

    /// Encodes this log page as a sealed [`PAGE_SIZE`] buffer, signed for
    /// `page_index`.
    pub fn encode(&self, page_index: PageIndex) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[..SIGNATURE_LEN].copy_from_slice(&signature_for(page_index));
        buf[SIZE_OFFSET..ENTRIES_OFFSET].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, pair) in self.entries.iter().enumerate() {
            let off = ENTRIES_OFFSET + i * ENTRY_LEN;
            buf[off..off + 4].copy_from_slice(&pair.original.to_le_bytes());
            buf[off + 4..off + 8].copy_from_slice(&pair.copy.to_le_bytes());
        }
        seal_page(&mut buf);
        buf
    }

    /// Attempts to decode `buf` as a log page signed for `page_index`.
    /// Returns `None` if the signature doesn't match (meaning this is an
    /// ordinary data page, not a log page) — the expected, non-error way a
    /// backward recovery scan terminates.
    pub fn decode(buf: &[u8; PAGE_SIZE], page_index: PageIndex) -> Option<Self> {
        if buf[..SIGNATURE_LEN] != signature_for(page_index) {
            return None;
        }
        if !verify_page(buf) {
            return None;
        }
        let size = u32::from_le_bytes(buf[SIZE_OFFSET..ENTRIES_OFFSET].try_into().unwrap()) as usize;
        if size > MAX_ENTRIES {
            return None;
        }
        let mut entries = Vec::with_capacity(size);
        for i in 0..size {
            let off = ENTRIES_OFFSET + i * ENTRY_LEN;
            let original = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            let copy = u32::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
            entries.push(PageCopy { original, copy });
        }
        Some(Self { entries })
    }
}
