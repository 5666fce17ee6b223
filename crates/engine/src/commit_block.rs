//! The commit block (spec §6): `{version, free_store_descriptor, composite_size,
//! max_folder_id}`, little-endian, packed, grounded on
//! `original_source/CompoundFs/CommitBlock.{h,cpp}`'s `toString`/`fromString`.
//!
//! The real `DirectoryStructure` that owns `m_maxFolderId` and persists this
//! block is out of scope here (spec §1). Since this crate's minimal facade
//! still needs some durable pointer to the B-tree's current root page (the
//! root moves on every split), one extra field, `btree_root`, is appended
//! after the spec's fields — the one piece of state a real directory layer
//! would otherwise own.

use common::{seal_page, verify_page, CoreError, DbResult, PageIndex, PAGE_SIZE};
use filestore::FileDescriptor;

pub const ENCODED_LEN: usize = 1 + 4 + 4 + 8 + 8 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitBlock {
    pub version: u8,
    pub free_store: FileDescriptor,
    pub composite_size: u64,
    pub max_folder_id: u32,
    pub btree_root: PageIndex,
}

impl CommitBlock {
    pub fn encode(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        let mut off = 0;
        buf[off] = self.version;
        off += 1;
        buf[off..off + 4].copy_from_slice(&self.free_store.first.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.free_store.last.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.free_store.size_bytes.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.composite_size.to_le_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.max_folder_id.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.btree_root.to_le_bytes());
        seal_page(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8; PAGE_SIZE], page_index: PageIndex) -> DbResult<Self> {
        if !verify_page(buf) {
            return Err(CoreError::ChecksumMismatch(page_index));
        }
        let mut off = 0;
        let version = buf[off];
        off += 1;
        let first = PageIndex::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let last = PageIndex::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let size_bytes = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let composite_size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let max_folder_id = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let btree_root = PageIndex::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(Self {
            version,
            free_store: FileDescriptor { first, last, size_bytes },
            composite_size,
            max_folder_id,
            btree_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let block = CommitBlock {
            version: 0,
            free_store: FileDescriptor { first: 7, last: 9, size_bytes: 123 },
            composite_size: 456,
            max_folder_id: 2,
            btree_root: 3,
        };
        let buf = block.encode();
        let decoded = CommitBlock::decode(&buf, 2).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn encoded_len_fits_within_one_page_comfortably() {
        assert!(ENCODED_LEN < PAGE_SIZE / 2);
    }
}
