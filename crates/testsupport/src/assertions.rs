//! Assertions shared by engine- and subsystem-level tests: walking a whole
//! key range via a cursor and comparing it against an expected set, and
//! round-tripping a stream's bytes.

use common::DbResult;
use engine::{Cursor, ReadTxn};
use hostfile::HostFile;
use std::collections::BTreeMap;

/// Walks every entry visible to `read` from the beginning of the key
/// space and returns them as a sorted map.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
///
/// let (mut engine, _guard) = temp_engine().unwrap();
/// let mut txn = engine.begin_write().unwrap();
/// txn.put(b"a", b"1").unwrap();
/// engine.commit(txn).unwrap();
///
/// let read = engine.begin_read();
/// let all = collect_all_entries(&read).unwrap();
/// assert_eq!(all.get(b"a".as_slice()), Some(&b"1".to_vec()));
/// ```
pub fn collect_all_entries<H: HostFile>(read: &ReadTxn<H>) -> DbResult<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut out = BTreeMap::new();
    let mut cursor: Option<Cursor> = read.begin(&[])?;
    while let Some(c) = cursor {
        out.insert(c.key().to_vec(), c.value().to_vec());
        cursor = read.next(&c)?;
    }
    Ok(out)
}

/// Asserts that `read` contains exactly the entries in `expected`, no
/// more and no fewer, comparing both keys and values.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
/// use std::collections::BTreeMap;
///
/// let (mut engine, _guard) = temp_engine().unwrap();
/// let mut txn = engine.begin_write().unwrap();
/// txn.put(b"a", b"1").unwrap();
/// engine.commit(txn).unwrap();
///
/// let mut expected = BTreeMap::new();
/// expected.insert(b"a".to_vec(), b"1".to_vec());
/// assert_btree_contains_exactly(&engine.begin_read(), &expected);
/// ```
pub fn assert_btree_contains_exactly<H: HostFile>(
    read: &ReadTxn<H>,
    expected: &BTreeMap<Vec<u8>, Vec<u8>>,
) {
    let actual = collect_all_entries(read).expect("walking the tree must not fail");
    assert_eq!(&actual, expected, "tree contents do not match the expected key set");
}

/// Asserts that the stream named `name_key` is present and its bytes are
/// exactly `expected`.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
///
/// let (mut engine, _guard) = temp_engine().unwrap();
/// let mut txn = engine.begin_write().unwrap();
/// txn.create_stream(b"log", b"hello").unwrap();
/// assert_stream_round_trips(&txn, b"log", b"hello");
/// ```
pub fn assert_stream_round_trips(read: &impl StreamReadable, name_key: &[u8], expected: &[u8]) {
    let actual = read
        .read_stream(name_key)
        .expect("reading the stream must not fail");
    assert_eq!(
        actual.as_deref(),
        Some(expected),
        "stream {name_key:?} did not round-trip"
    );
}

/// Narrow trait letting [`assert_stream_round_trips`] take either a
/// [`engine::Txn`] (mid-transaction) or a [`ReadTxn`] (post-commit).
pub trait StreamReadable {
    fn read_stream(&self, name_key: &[u8]) -> DbResult<Option<Vec<u8>>>;
}

impl<H: HostFile> StreamReadable for engine::Txn<H> {
    fn read_stream(&self, name_key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        engine::Txn::read_stream(self, name_key)
    }
}

impl<H: HostFile> StreamReadable for ReadTxn<H> {
    fn read_stream(&self, name_key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        ReadTxn::read_stream(self, name_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::temp_engine;

    #[test]
    fn collect_all_entries_sees_every_committed_key() {
        let (mut engine, _guard) = temp_engine().unwrap();
        let mut txn = engine.begin_write().unwrap();
        txn.put(b"b", b"2").unwrap();
        txn.put(b"a", b"1").unwrap();
        engine.commit(txn).unwrap();

        let read = engine.begin_read();
        let all = collect_all_entries(&read).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert(b"a".to_vec(), b"1".to_vec());
        expected.insert(b"b".to_vec(), b"2".to_vec());
        assert_eq!(all, expected);
        assert_btree_contains_exactly(&read, &expected);
    }

    #[test]
    fn assert_stream_round_trips_accepts_both_txn_kinds() {
        let (mut engine, _guard) = temp_engine().unwrap();
        let mut txn = engine.begin_write().unwrap();
        txn.create_stream(b"s", b"payload").unwrap();
        assert_stream_round_trips(&txn, b"s", b"payload");
        engine.commit(txn).unwrap();

        let read = engine.begin_read();
        assert_stream_round_trips(&read, b"s", b"payload");
    }
}
