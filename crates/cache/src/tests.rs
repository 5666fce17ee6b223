use crate::*;
use common::PAGE_SIZE;
use hostfile::MemHostFile;

fn new_cache(max: usize) -> PageCache<MemHostFile> {
    PageCache::new(MemHostFile::new(), max)
}

fn commit(cache: &mut PageCache<MemHostFile>) {
    match cache.plan_commit() {
        CommitPlan::NoOp => {}
        CommitPlan::NewPagesOnly => cache.commit_new_pages_only().unwrap(),
        CommitPlan::NeedsLog { dirty_ids } => {
            let prelude = cache.commit_prelude(&dirty_ids).unwrap();
            cache.commit_publish(&prelude).unwrap();
            cache.commit_finish(prelude).unwrap();
        }
    }
}

#[test]
fn new_page_allocates_and_is_readable_after_commit() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 42;
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    let read_back = cache.load_page(id).unwrap();
    assert_eq!(read_back.borrow()[0], 42);
}

#[test]
fn make_writable_promotes_read_to_dirty_and_survives_commit() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 1;
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    let writable = cache.make_writable(id).unwrap();
    writable.borrow_mut()[0] = 2;
    assert_eq!(cache.dirty_page_ids(), vec![id]);
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    let read_back = cache.load_page(id).unwrap();
    assert_eq!(read_back.borrow()[0], 2);
}

#[test]
fn no_op_commit_when_nothing_changed() {
    let mut cache = new_cache(256);
    assert!(matches!(cache.plan_commit(), CommitPlan::NoOp));
}

#[test]
fn new_pages_only_commit_needs_no_log() {
    let mut cache = new_cache(256);
    let size_before = cache.host_mut().file_size_in_pages().unwrap();
    cache.new_page().unwrap();
    assert!(matches!(cache.plan_commit(), CommitPlan::NewPagesOnly));
    commit(&mut cache);
    // exactly one page appended: no copy/log pages left behind.
    assert_eq!(cache.host_mut().file_size_in_pages().unwrap(), size_before + 1);
}

#[test]
fn logged_commit_truncates_away_copies_and_logs() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 9;
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    let size_before_dirty_commit = cache.host_mut().file_size_in_pages().unwrap();
    cache.make_writable(id).unwrap().borrow_mut()[0] = 10;
    commit(&mut cache);

    // after the logged commit, the file must be back down to its
    // pre-commit size: no copy or log page left behind.
    assert_eq!(
        cache.host_mut().file_size_in_pages().unwrap(),
        size_before_dirty_commit
    );
}

#[test]
fn eviction_diverts_dirty_pages_and_load_page_redirects() {
    // max_cached_pages small enough that the second new_page triggers a trim.
    let mut cache = new_cache(2);
    let (buf_a, id_a) = cache.new_page().unwrap();
    buf_a.borrow_mut()[0] = 1;
    commit(&mut cache);
    drop(buf_a);

    let mut cache = PageCache::new(cache.host, 2);
    let writable = cache.make_writable(id_a).unwrap();
    writable.borrow_mut()[0] = 77;
    drop(writable);

    // force eviction of the now-unpinned dirty page.
    cache.trim(0).unwrap();
    assert!(cache.is_empty());

    // a fresh load must redirect through the diversion map to the evicted
    // copy, not the (stale) original disk slot.
    let reloaded = cache.load_page(id_a).unwrap();
    assert_eq!(reloaded.borrow()[0], 77);

    commit(&mut cache);
    let mut cache = PageCache::new(cache.host, 2);
    let final_read = cache.load_page(id_a).unwrap();
    assert_eq!(final_read.borrow()[0], 77);
}

#[test]
fn twice_diverted_dirty_page_keeps_latest_content() {
    // Exercises the scenario that breaks the original's single-hop
    // diversion map: evict a dirty page, reload it, mutate it again, evict
    // it a second time, and confirm the latest content (not the first
    // eviction's stale copy) is what gets published.
    let mut cache = new_cache(1);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 1;
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 1);
    cache.make_writable(id).unwrap().borrow_mut()[0] = 2;
    cache.trim(0).unwrap(); // first eviction: diverted[id] = copy1

    let reloaded = cache.make_writable(id).unwrap();
    reloaded.borrow_mut()[0] = 3;
    drop(reloaded);
    cache.trim(0).unwrap(); // second eviction: diverted[id] must now be copy2

    let latest = cache.load_page(id).unwrap();
    assert_eq!(latest.borrow()[0], 3);

    commit(&mut cache);
    let mut cache = PageCache::new(cache.host, 1);
    assert_eq!(cache.load_page(id).unwrap().borrow()[0], 3);
}

#[test]
fn pinned_page_survives_trim() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    let pinned = cache.load_page(id).unwrap();
    cache.trim(0).unwrap();
    assert_eq!(cache.len(), 1, "page held by a client handle must not be evicted");
    drop(pinned);
    drop(buf);
}

#[test]
fn rollback_discards_uncommitted_work_and_truncates() {
    let mut cache = new_cache(256);
    let size_before = cache.host_mut().file_size_in_pages().unwrap();
    cache.new_page().unwrap();
    cache.new_page().unwrap();
    assert!(cache.host_mut().file_size_in_pages().unwrap() > size_before);

    cache.rollback(size_before).unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.host_mut().file_size_in_pages().unwrap(), size_before);
}

#[test]
fn crash_before_truncate_is_undone_by_physical_recovery() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 1;
    commit(&mut cache);
    let composite_size = cache.host_mut().file_size_in_pages().unwrap();

    let mut cache = PageCache::new(cache.host, 256);
    cache.make_writable(id).unwrap().borrow_mut()[0] = 99;

    // simulate a crash: run the prelude and publish, but never call
    // commit_finish (the truncate that makes the commit durable).
    let dirty_ids = cache.dirty_page_ids();
    let prelude = cache.commit_prelude(&dirty_ids).unwrap();
    cache.commit_publish(&prelude).unwrap();
    // no commit_finish: log + copy pages are still on disk.

    let mut recovery_cache = PageCache::new(cache.host, 256);
    recovery_cache.recover_physical().unwrap();
    recovery_cache.rollback(composite_size).unwrap();

    let mut reopened = PageCache::new(recovery_cache.host, 256);
    assert_eq!(
        reopened.load_page(id).unwrap().borrow()[0],
        1,
        "an uncompleted commit must be fully undone on recovery"
    );
    assert_eq!(reopened.host_mut().file_size_in_pages().unwrap(), composite_size);
}

#[test]
fn virtual_recovery_reads_pre_commit_view_without_mutating_file() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 1;
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    cache.make_writable(id).unwrap().borrow_mut()[0] = 99;
    let dirty_ids = cache.dirty_page_ids();
    let prelude = cache.commit_prelude(&dirty_ids).unwrap();
    cache.commit_publish(&prelude).unwrap();
    // crash again before commit_finish; open read-only this time.

    let size_with_logs = cache.host_mut().file_size_in_pages().unwrap();
    let mut reader = PageCache::new(cache.host, 256);
    reader.recover_virtual().unwrap();

    assert_eq!(reader.load_page(id).unwrap().borrow()[0], 1);
    // virtual recovery must not truncate or otherwise mutate the file.
    assert_eq!(reader.host_mut().file_size_in_pages().unwrap(), size_with_logs);
}

#[test]
fn completed_commit_leaves_no_recoverable_log() {
    let mut cache = new_cache(256);
    let (buf, id) = cache.new_page().unwrap();
    buf.borrow_mut()[0] = 1;
    commit(&mut cache);

    let mut cache = PageCache::new(cache.host, 256);
    cache.make_writable(id).unwrap().borrow_mut()[0] = 2;
    commit(&mut cache);

    let pairs = cache.scan_log_pages().unwrap();
    assert!(pairs.is_empty(), "a completed commit must leave the log clean");
}

#[test]
fn checksum_mismatch_on_read_is_fatal() {
    let mut cache = new_cache(256);
    let (_buf, id) = cache.new_page().unwrap();
    commit(&mut cache);

    // corrupt the page directly on the host, bypassing the cache.
    let mut corrupt = [0u8; PAGE_SIZE];
    corrupt[0] = 0xFF;
    // leave the checksum trailer as zero, which will not match.
    cache.host_mut().write_page_full(id, &corrupt).unwrap();

    let mut cache = PageCache::new(cache.host, 256);
    let err = cache.load_page(id).unwrap_err();
    assert!(matches!(err, common::CoreError::ChecksumMismatch(_)));
}
