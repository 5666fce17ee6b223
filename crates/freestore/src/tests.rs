use crate::*;
use hostfile::MemHostFile;

fn new_cache() -> Rc<RefCell<PageCache<MemHostFile>>> {
    Rc::new(RefCell::new(PageCache::new(MemHostFile::new(), 1024)))
}

/// Hand-builds a FileTable chain describing `groups` (one group per page),
/// bypassing `filestore::Writer` since we want to control exactly which
/// intervals land in which table for these tests.
fn build_table_chain(cache: &Rc<RefCell<PageCache<MemHostFile>>>, groups: &[Vec<Interval>]) -> FileDescriptor {
    let mut pages = Vec::new();
    for _ in groups {
        pages.push(cache.borrow_mut().new_page().unwrap());
    }
    for (i, group) in groups.iter().enumerate() {
        let next = if i + 1 < pages.len() { pages[i + 1].1 } else { PageIndex::INVALID };
        let table = FileTable { next, intervals: group.clone() };
        *pages[i].0.borrow_mut() = table.encode();
    }
    FileDescriptor { first: pages[0].1, last: pages.last().unwrap().1, size_bytes: 0 }
}

#[test]
fn allocate_from_an_empty_store_returns_an_empty_interval() {
    let cache = new_cache();
    let mut store = FreeStore::open(cache, FileDescriptor::empty());
    let iv = store.allocate(4).unwrap();
    assert!(iv.is_empty());
}

#[test]
fn deallocated_pages_survive_a_close_and_reopen_cycle() {
    let cache = new_cache();
    let mut store = FreeStore::open(cache.clone(), FileDescriptor::empty());
    let (_buf_a, id_a) = cache.borrow_mut().new_page().unwrap();
    let (_buf_b, id_b) = cache.borrow_mut().new_page().unwrap();
    store.deallocate(id_a);
    store.deallocate(id_b);

    let descriptor = store.close().unwrap();
    assert!(descriptor.first.is_valid());

    let mut reopened = FreeStore::open(cache, descriptor);
    let mut got = Vec::new();
    loop {
        let iv = reopened.allocate(1).unwrap();
        if iv.is_empty() {
            break;
        }
        got.push(iv.begin());
    }
    got.sort();
    let mut expected = vec![id_a, id_b];
    expected.sort();
    assert_eq!(got, expected);
}

#[test]
fn deleting_a_single_table_stream_reclaims_both_its_content_and_table_page() {
    let cache = new_cache();
    let mut writer = filestore::Writer::open_append(cache.clone(), &FileDescriptor::empty(), 250_000).unwrap();
    writer.write(b"small payload").unwrap();
    let fd = writer.close().unwrap();
    assert_eq!(fd.first, fd.last, "a tiny stream should fit one FileTable");
    let table_page = fd.first;

    let mut store = FreeStore::open(cache.clone(), FileDescriptor::empty());
    store.delete(fd);
    let descriptor = store.close().unwrap();

    let mut reopened = FreeStore::open(cache, descriptor);
    let mut reclaimed = Vec::new();
    loop {
        let iv = reopened.allocate(1).unwrap();
        if iv.is_empty() {
            break;
        }
        reclaimed.push(iv.begin());
    }
    assert!(reclaimed.contains(&table_page), "the table page itself must become reusable");
    // the content page(s) behind it must also come back.
    assert!(reclaimed.len() >= 2);
}

#[test]
fn deleting_a_multi_table_stream_splices_its_chain_onto_the_tail_unchanged() {
    let cache = new_cache();
    let mut writer = filestore::Writer::open_append(cache.clone(), &FileDescriptor::empty(), 1).unwrap();
    writer.write(&vec![b'a'; common::PAGE_SIZE]).unwrap();
    let mut spacer = filestore::Writer::open_append(cache.clone(), &FileDescriptor::empty(), 250_000).unwrap();
    spacer.write(&vec![b'z'; common::PAGE_SIZE]).unwrap();
    let _spacer_fd = spacer.close().unwrap();
    writer.write(&vec![b'a'; common::PAGE_SIZE]).unwrap();
    let fd = writer.close().unwrap();
    assert_ne!(fd.first, fd.last, "the low watermark should force a multi-table chain");

    let mut store = FreeStore::open(cache.clone(), FileDescriptor::empty());
    store.delete(fd);
    let descriptor = store.close().unwrap();
    assert_eq!(descriptor.first, fd.first, "a lone surviving chain becomes the new chain verbatim");
    assert_eq!(descriptor.last, fd.last);
}

#[test]
fn reclaimed_bytes_accumulates_across_deletions() {
    let cache = new_cache();
    let mut w1 = filestore::Writer::open_append(cache.clone(), &FileDescriptor::empty(), 250_000).unwrap();
    w1.write(b"12345").unwrap();
    let fd1 = w1.close().unwrap();
    let mut w2 = filestore::Writer::open_append(cache.clone(), &FileDescriptor::empty(), 250_000).unwrap();
    w2.write(b"1234567890").unwrap();
    let fd2 = w2.close().unwrap();

    let mut store = FreeStore::open(cache, FileDescriptor::empty());
    store.delete(fd1);
    store.delete(fd2);
    store.close().unwrap();
    assert_eq!(store.reclaimed_bytes(), 15);
}

#[test]
fn closing_consumes_an_unread_tail_of_a_pre_existing_chain_without_losing_pages() {
    let cache = new_cache();
    let a = Interval::single(500);
    let b = Interval::single(501);
    let pre_existing = build_table_chain(&cache, &[vec![a], vec![b]]);

    let mut store = FreeStore::open(cache.clone(), pre_existing);
    // never call allocate(): close() must still pull in the whole chain
    // rather than silently dropping the tail table.
    let descriptor = store.close().unwrap();

    let mut reopened = FreeStore::open(cache, descriptor);
    let mut got = Vec::new();
    loop {
        let iv = reopened.allocate(1).unwrap();
        if iv.is_empty() {
            break;
        }
        got.push(iv.begin());
    }
    assert!(got.contains(&500));
    assert!(got.contains(&501));
    // the two original table pages themselves are reclaimable too.
    assert_eq!(got.len(), 4);
}
