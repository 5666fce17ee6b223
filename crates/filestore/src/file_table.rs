//! FileTable page layout (spec §4.3): a chain of pages, each holding a run
//! of `Interval`s describing a stream's extents plus a `next` pointer to
//! the following table.
//!
//! Grounded on the same two-ended packing idea as `btree::node`: interval
//! data grows from the low end of the region, a bitmap marking which
//! entries are single pages (4 bytes) versus two-word ranges (8 bytes)
//! grows from the high end so single-page runs don't pay for an unused
//! `end` field.

use common::{seal_page, verify_page, CoreError, DbResult, Interval, PageIndex, PageIndexExt, PAGE_PAYLOAD_SIZE, PAGE_SIZE};
use std::collections::VecDeque;

/// `next` pointer (4 bytes) + entry count (2 bytes).
const HEADER_LEN: usize = 6;

/// Usable bytes for interval data plus the bitmap, after the header and
/// before the trailing checksum.
pub const REGION_LEN: usize = PAGE_PAYLOAD_SIZE - HEADER_LEN;

/// Decoded view of one FileTable page.
#[derive(Clone, Debug, PartialEq)]
pub struct FileTable {
    pub next: PageIndex,
    pub intervals: Vec<Interval>,
}

impl Default for FileTable {
    /// A terminal, empty table. `next` defaults to `PageIndex::INVALID`,
    /// not `0` — page `0` is a real page elsewhere in this filesystem.
    fn default() -> Self {
        Self { next: PageIndex::INVALID, intervals: Vec::new() }
    }
}

fn interval_data_len(iv: &Interval) -> usize {
    if iv.length() == 1 {
        4
    } else {
        8
    }
}

/// Bytes a run of `count` entries costs once the bitmap is included.
fn packed_len(data_bytes: usize, count: usize) -> usize {
    data_bytes + (count + 7) / 8
}

/// Greedily pops entries off the front of `remaining` until the next one
/// would overflow a page's `REGION_LEN`, returning the entries taken.
/// Used by `Writer::flush` to cut an unbounded interval queue into
/// page-sized FileTable chunks.
pub fn take_page_worth(remaining: &mut VecDeque<Interval>) -> Vec<Interval> {
    let mut taken: Vec<Interval> = Vec::new();
    let mut data_bytes = 0usize;
    while let Some(iv) = remaining.front().copied() {
        let candidate_data = data_bytes + interval_data_len(&iv);
        if packed_len(candidate_data, taken.len() + 1) > REGION_LEN {
            break;
        }
        data_bytes = candidate_data;
        taken.push(iv);
        remaining.pop_front();
    }
    taken
}

impl FileTable {
    pub fn encode(&self) -> [u8; PAGE_SIZE] {
        assert!(
            packed_len(
                self.intervals.iter().map(interval_data_len).sum(),
                self.intervals.len()
            ) <= REGION_LEN,
            "file table entries must fit REGION_LEN"
        );

        let mut buf = [0u8; PAGE_SIZE];
        buf[0..4].copy_from_slice(&self.next.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.intervals.len() as u16).to_le_bytes());

        let bitmap_bytes = (self.intervals.len() + 7) / 8;
        let bitmap_start = REGION_LEN - bitmap_bytes;
        let region = &mut buf[HEADER_LEN..PAGE_PAYLOAD_SIZE];
        let mut data_off = 0usize;
        for (i, iv) in self.intervals.iter().enumerate() {
            region[data_off..data_off + 4].copy_from_slice(&iv.begin().to_le_bytes());
            data_off += 4;
            if iv.length() != 1 {
                region[data_off..data_off + 4].copy_from_slice(&iv.end().to_le_bytes());
                data_off += 4;
                region[bitmap_start + i / 8] |= 1 << (i % 8);
            }
        }

        seal_page(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8; PAGE_SIZE], page_index: PageIndex) -> DbResult<Self> {
        if !verify_page(buf) {
            return Err(CoreError::ChecksumMismatch(page_index));
        }
        let next = PageIndex::from_le_bytes(buf[0..4].try_into().unwrap());
        let count = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;

        let bitmap_bytes = (count + 7) / 8;
        let bitmap_start = REGION_LEN - bitmap_bytes;
        let region = &buf[HEADER_LEN..PAGE_PAYLOAD_SIZE];
        let mut intervals = Vec::with_capacity(count);
        let mut data_off = 0usize;
        for i in 0..count {
            let is_range = region[bitmap_start + i / 8] & (1 << (i % 8)) != 0;
            let begin = PageIndex::from_le_bytes(region[data_off..data_off + 4].try_into().unwrap());
            data_off += 4;
            let iv = if is_range {
                let end = PageIndex::from_le_bytes(region[data_off..data_off + 4].try_into().unwrap());
                data_off += 4;
                Interval::new(begin, end)
            } else {
                Interval::single(begin)
            };
            intervals.push(iv);
        }
        Ok(Self { next, intervals })
    }
}
